use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{EntityTrait, Schema};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_catalog_tables::Migration),
            Box::new(m20240101_000002_create_order_tables::Migration),
            Box::new(m20240101_000003_create_ledger_tables::Migration),
            Box::new(m20240101_000004_create_return_tables::Migration),
            Box::new(m20240101_000005_create_saga_tables::Migration),
        ]
    }
}

/// Creates the table for `entity` exactly as its model declares it.
async fn create_entity_table<E>(manager: &SchemaManager<'_>, entity: E) -> Result<(), DbErr>
where
    E: EntityTrait,
{
    let schema = Schema::new(manager.get_database_backend());
    manager
        .create_table(
            schema
                .create_table_from_entity(entity)
                .if_not_exists()
                .to_owned(),
        )
        .await
}

async fn create_index(
    manager: &SchemaManager<'_>,
    name: &str,
    table: impl IntoTableRef,
    cols: Vec<DynIden>,
    unique: bool,
) -> Result<(), DbErr> {
    let mut index = Index::create();
    index.if_not_exists().name(name).table(table);
    for col in cols {
        index.col(col);
    }
    if unique {
        index.unique();
    }
    manager.create_index(index.to_owned()).await
}

mod m20240101_000001_create_catalog_tables {
    use super::*;
    use crate::entities::{combo_component, customer, product, stock_movement, stock_position};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, product::Entity).await?;
            create_entity_table(manager, combo_component::Entity).await?;
            create_entity_table(manager, stock_position::Entity).await?;
            create_entity_table(manager, stock_movement::Entity).await?;
            create_entity_table(manager, customer::Entity).await?;

            create_index(
                manager,
                "idx_products_tenant_sku",
                product::Entity,
                vec![
                    product::Column::TenantId.into_iden(),
                    product::Column::Sku.into_iden(),
                ],
                true,
            )
            .await?;

            // The conditional stock update relies on one row per pair.
            create_index(
                manager,
                "idx_stock_positions_warehouse_product",
                stock_position::Entity,
                vec![
                    stock_position::Column::WarehouseId.into_iden(),
                    stock_position::Column::ProductId.into_iden(),
                ],
                true,
            )
            .await?;

            create_index(
                manager,
                "idx_stock_movements_order",
                stock_movement::Entity,
                vec![stock_movement::Column::OrderId.into_iden()],
                false,
            )
            .await?;

            create_index(
                manager,
                "idx_combo_components_combo",
                combo_component::Entity,
                vec![combo_component::Column::ComboId.into_iden()],
                false,
            )
            .await?;

            create_index(
                manager,
                "idx_customers_tenant_phone",
                customer::Entity,
                vec![
                    customer::Column::TenantId.into_iden(),
                    customer::Column::Phone.into_iden(),
                ],
                true,
            )
            .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            for table in [
                customer::Entity.into_table_ref(),
                stock_movement::Entity.into_table_ref(),
                stock_position::Entity.into_table_ref(),
                combo_component::Entity.into_table_ref(),
                product::Entity.into_table_ref(),
            ] {
                manager
                    .drop_table(Table::drop().table(table).if_exists().to_owned())
                    .await?;
            }
            Ok(())
        }
    }
}

mod m20240101_000002_create_order_tables {
    use super::*;
    use crate::entities::{order, order_line, warranty};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, order::Entity).await?;
            create_entity_table(manager, order_line::Entity).await?;
            create_entity_table(manager, warranty::Entity).await?;

            // Order numbers are idempotency keys.
            create_index(
                manager,
                "idx_orders_tenant_number",
                order::Entity,
                vec![
                    order::Column::TenantId.into_iden(),
                    order::Column::OrderNumber.into_iden(),
                ],
                true,
            )
            .await?;

            create_index(
                manager,
                "idx_orders_tracking_number",
                order::Entity,
                vec![order::Column::TrackingNumber.into_iden()],
                false,
            )
            .await?;

            create_index(
                manager,
                "idx_order_lines_order",
                order_line::Entity,
                vec![order_line::Column::OrderId.into_iden()],
                false,
            )
            .await?;

            create_index(
                manager,
                "idx_warranties_order",
                warranty::Entity,
                vec![warranty::Column::OrderId.into_iden()],
                false,
            )
            .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            for table in [
                warranty::Entity.into_table_ref(),
                order_line::Entity.into_table_ref(),
                order::Entity.into_table_ref(),
            ] {
                manager
                    .drop_table(Table::drop().table(table).if_exists().to_owned())
                    .await?;
            }
            Ok(())
        }
    }
}

mod m20240101_000003_create_ledger_tables {
    use super::*;
    use crate::entities::{
        cod_reconciliation, coupon, coupon_usage, payment_transaction, point_transaction,
    };

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_ledger_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, payment_transaction::Entity).await?;
            create_entity_table(manager, coupon::Entity).await?;
            create_entity_table(manager, coupon_usage::Entity).await?;
            create_entity_table(manager, point_transaction::Entity).await?;
            create_entity_table(manager, cod_reconciliation::Entity).await?;

            // Receipt numbers guard against duplicate receipts on replay.
            create_index(
                manager,
                "idx_payment_transactions_order_receipt",
                payment_transaction::Entity,
                vec![
                    payment_transaction::Column::OrderId.into_iden(),
                    payment_transaction::Column::ReceiptNumber.into_iden(),
                ],
                true,
            )
            .await?;

            create_index(
                manager,
                "idx_coupons_tenant_code",
                coupon::Entity,
                vec![
                    coupon::Column::TenantId.into_iden(),
                    coupon::Column::Code.into_iden(),
                ],
                true,
            )
            .await?;

            create_index(
                manager,
                "idx_coupon_usages_coupon",
                coupon_usage::Entity,
                vec![coupon_usage::Column::CouponId.into_iden()],
                false,
            )
            .await?;

            create_index(
                manager,
                "idx_point_transactions_customer",
                point_transaction::Entity,
                vec![point_transaction::Column::CustomerId.into_iden()],
                false,
            )
            .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            for table in [
                cod_reconciliation::Entity.into_table_ref(),
                point_transaction::Entity.into_table_ref(),
                coupon_usage::Entity.into_table_ref(),
                coupon::Entity.into_table_ref(),
                payment_transaction::Entity.into_table_ref(),
            ] {
                manager
                    .drop_table(Table::drop().table(table).if_exists().to_owned())
                    .await?;
            }
            Ok(())
        }
    }
}

mod m20240101_000004_create_return_tables {
    use super::*;
    use crate::entities::{return_line, return_record};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_return_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, return_record::Entity).await?;
            create_entity_table(manager, return_line::Entity).await?;

            create_index(
                manager,
                "idx_returns_order_code",
                return_record::Entity,
                vec![
                    return_record::Column::OrderId.into_iden(),
                    return_record::Column::Code.into_iden(),
                ],
                true,
            )
            .await?;

            create_index(
                manager,
                "idx_return_lines_order",
                return_line::Entity,
                vec![return_line::Column::OrderId.into_iden()],
                false,
            )
            .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(
                    Table::drop()
                        .table(return_line::Entity)
                        .if_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .drop_table(
                    Table::drop()
                        .table(return_record::Entity)
                        .if_exists()
                        .to_owned(),
                )
                .await
        }
    }
}

mod m20240101_000005_create_saga_tables {
    use super::*;
    use crate::entities::{activity_log, saga_log, saga_step};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_saga_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, saga_log::Entity).await?;
            create_entity_table(manager, saga_step::Entity).await?;
            create_entity_table(manager, activity_log::Entity).await?;

            create_index(
                manager,
                "idx_saga_steps_saga_key",
                saga_step::Entity,
                vec![
                    saga_step::Column::SagaId.into_iden(),
                    saga_step::Column::StepKey.into_iden(),
                ],
                true,
            )
            .await?;

            create_index(
                manager,
                "idx_activity_logs_entity",
                activity_log::Entity,
                vec![
                    activity_log::Column::EntityType.into_iden(),
                    activity_log::Column::EntityId.into_iden(),
                ],
                false,
            )
            .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            for table in [
                activity_log::Entity.into_table_ref(),
                saga_step::Entity.into_table_ref(),
                saga_log::Entity.into_table_ref(),
            ] {
                manager
                    .drop_table(Table::drop().table(table).if_exists().to_owned())
                    .await?;
            }
            Ok(())
        }
    }
}
