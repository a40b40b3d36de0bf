// Catalog and stock
pub mod combo_component;
pub mod product;
pub mod stock_movement;
pub mod stock_position;

// Orders
pub mod order;
pub mod order_line;
pub mod warranty;

// Money, loyalty and promotions
pub mod cod_reconciliation;
pub mod coupon;
pub mod coupon_usage;
pub mod customer;
pub mod payment_transaction;
pub mod point_transaction;

// Returns
pub mod return_line;
pub mod return_record;

// Saga and audit infrastructure
pub mod activity_log;
pub mod saga_log;
pub mod saga_step;
