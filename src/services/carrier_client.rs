//! JSON client for a GHN-style carrier API: `Token` header auth and a
//! `{code, message, data}` envelope on every response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::CarrierConfig;
use crate::services::carriers::{
    CarrierClient, CarrierError, CarrierOrder, CarrierStatus, District, Province, QuoteRequest,
    ShipmentRequest, Ward,
};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FeeData {
    total: Decimal,
}

#[derive(Debug, Deserialize)]
struct CreatedOrderData {
    order_code: String,
    total_fee: Option<Decimal>,
    expected_delivery_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct OrderDetailData {
    order_code: String,
    status: String,
    #[serde(default)]
    status_text: Option<String>,
    updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ProvinceData {
    #[serde(rename = "ProvinceID")]
    province_id: i32,
    #[serde(rename = "ProvinceName")]
    province_name: String,
}

#[derive(Debug, Deserialize)]
struct DistrictData {
    #[serde(rename = "DistrictID")]
    district_id: i32,
    #[serde(rename = "ProvinceID")]
    province_id: i32,
    #[serde(rename = "DistrictName")]
    district_name: String,
}

#[derive(Debug, Deserialize)]
struct WardData {
    #[serde(rename = "WardCode")]
    ward_code: String,
    #[serde(rename = "DistrictID")]
    district_id: i32,
    #[serde(rename = "WardName")]
    ward_name: String,
}

fn whole_amount(amount: Decimal) -> i64 {
    amount.round().to_i64().unwrap_or(0)
}

pub struct HttpCarrierClient {
    client: Client,
    base_url: String,
}

impl HttpCarrierClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, CarrierError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let token = HeaderValue::from_str(&config.api_token)
            .map_err(|e| CarrierError::InvalidResponse(format!("invalid api token: {}", e)))?;
        headers.insert("Token", token);

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| CarrierError::Transport(e.to_string()))?;

        Ok(Self::with_client(config.base_url.clone(), client))
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, CarrierError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CarrierError::Timeout
            } else {
                CarrierError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        debug!(path, %status, "carrier responded");
        if status.is_server_error() {
            return Err(CarrierError::Transport(format!("{} returned {}", path, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CarrierError::Transport(e.to_string()))?;
        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            if status.is_client_error() {
                CarrierError::Rejected(format!("{} returned {}", path, status))
            } else {
                CarrierError::InvalidResponse(e.to_string())
            }
        })?;

        if status != StatusCode::OK || envelope.code != 200 {
            return Err(CarrierError::Rejected(envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| CarrierError::InvalidResponse(format!("{} returned no data", path)))
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, CarrierError> {
        self.call(self.client.post(self.url(path)).json(&body), path)
            .await
    }
}

#[async_trait]
impl CarrierClient for HttpCarrierClient {
    async fn quote(&self, request: &QuoteRequest) -> Result<Decimal, CarrierError> {
        let fee: FeeData = self
            .post(
                "shipping-order/fee",
                json!({
                    "to_district_id": request.to_district_id,
                    "to_ward_code": request.to_ward_code,
                    "weight": request.weight_grams,
                    "insurance_value": whole_amount(request.insurance_value),
                }),
            )
            .await?;
        Ok(fee.total)
    }

    async fn create_order(&self, request: &ShipmentRequest) -> Result<CarrierOrder, CarrierError> {
        let items: Vec<Value> = request
            .items
            .iter()
            .map(|item| json!({ "name": item.name, "quantity": item.quantity }))
            .collect();

        let created: CreatedOrderData = self
            .post(
                "shipping-order/create",
                json!({
                    "client_order_code": request.client_order_code,
                    "to_name": request.recipient_name,
                    "to_phone": request.recipient_phone,
                    "to_address": request.address.street.clone().unwrap_or_default(),
                    "to_ward_code": request.address.ward_code,
                    "to_district_id": request.address.district_id,
                    "cod_amount": whole_amount(request.cod_amount),
                    "insurance_value": whole_amount(request.insurance_value),
                    "weight": request.weight_grams,
                    "note": request.note,
                    "items": items,
                }),
            )
            .await?;

        Ok(CarrierOrder {
            tracking_number: created.order_code,
            fee: created.total_fee,
            expected_delivery: created.expected_delivery_time,
        })
    }

    async fn get_tracking(&self, tracking_number: &str) -> Result<CarrierStatus, CarrierError> {
        let detail: OrderDetailData = self
            .post(
                "shipping-order/detail",
                json!({ "order_code": tracking_number }),
            )
            .await?;

        Ok(CarrierStatus {
            tracking_number: detail.order_code,
            status_code: detail.status,
            status_text: detail.status_text,
            updated_at: detail.updated_date,
        })
    }

    async fn provinces(&self) -> Result<Vec<Province>, CarrierError> {
        let path = "master-data/province";
        let rows: Vec<ProvinceData> = self.call(self.client.get(self.url(path)), path).await?;
        Ok(rows
            .into_iter()
            .map(|p| Province {
                id: p.province_id,
                name: p.province_name,
            })
            .collect())
    }

    async fn districts(&self, province_id: i32) -> Result<Vec<District>, CarrierError> {
        let rows: Vec<DistrictData> = self
            .post("master-data/district", json!({ "province_id": province_id }))
            .await?;
        Ok(rows
            .into_iter()
            .map(|d| District {
                id: d.district_id,
                province_id: d.province_id,
                name: d.district_name,
            })
            .collect())
    }

    async fn wards(&self, district_id: i32) -> Result<Vec<Ward>, CarrierError> {
        let rows: Vec<WardData> = self
            .post("master-data/ward", json!({ "district_id": district_id }))
            .await?;
        Ok(rows
            .into_iter()
            .map(|w| Ward {
                code: w.ward_code,
                district_id: w.district_id,
                name: w.ward_name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::carriers::{Address, ShipmentItem};
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> HttpCarrierClient {
        let config = CarrierConfig {
            base_url: server.uri(),
            api_token: "secret-token".into(),
            ..CarrierConfig::default()
        };
        HttpCarrierClient::new(&config).unwrap()
    }

    fn shipment() -> ShipmentRequest {
        ShipmentRequest {
            client_order_code: "ORD-20240501-0001".into(),
            recipient_name: "Lan".into(),
            recipient_phone: "0901234567".into(),
            address: Address {
                province_id: 202,
                district_id: 1442,
                ward_code: "20109".into(),
                street: Some("12 Le Loi".into()),
            },
            cod_amount: dec!(250000),
            insurance_value: dec!(250000),
            weight_grams: 1000,
            items: vec![ShipmentItem {
                name: "T-shirt".into(),
                quantity: 2,
            }],
            note: None,
        }
    }

    #[tokio::test]
    async fn creates_order_with_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shipping-order/create"))
            .and(header("Token", "secret-token"))
            .and(body_partial_json(json!({
                "client_order_code": "ORD-20240501-0001",
                "cod_amount": 250000,
                "to_district_id": 1442
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "Success",
                "data": { "order_code": "GHN5X7K", "total_fee": 33000 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let order = client_for(&server).await.create_order(&shipment()).await.unwrap();
        assert_eq!(order.tracking_number, "GHN5X7K");
        assert_eq!(order.fee, Some(dec!(33000)));
    }

    #[tokio::test]
    async fn rejected_request_carries_carrier_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shipping-order/create"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": 400,
                "message": "Ward code is not served",
                "data": null
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).await.create_order(&shipment()).await.unwrap_err();
        assert_eq!(err, CarrierError::Rejected("Ward code is not served".into()));
    }

    #[tokio::test]
    async fn server_errors_are_transport_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shipping-order/detail"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).await.get_tracking("GHN5X7K").await.unwrap_err();
        assert!(matches!(err, CarrierError::Transport(_)));
    }

    #[tokio::test]
    async fn reads_tracking_and_master_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shipping-order/detail"))
            .and(body_partial_json(json!({ "order_code": "GHN5X7K" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "Success",
                "data": { "order_code": "GHN5X7K", "status": "delivering" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/master-data/province"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "Success",
                "data": [{ "ProvinceID": 202, "ProvinceName": "Ho Chi Minh" }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let status = client.get_tracking("GHN5X7K").await.unwrap();
        assert_eq!(status.status_code, "delivering");
        assert_eq!(
            client.provinces().await.unwrap(),
            vec![Province {
                id: 202,
                name: "Ho Chi Minh".into()
            }]
        );
    }
}
