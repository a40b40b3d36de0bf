// Ledgers
pub mod inventory;
pub mod loyalty;
pub mod payments;
pub mod promotions;

// Carrier integration
pub mod carrier_client;
pub mod carriers;

// Order lifecycle and workflows built on it
pub mod bulk_dispatch;
pub mod order_merge;
pub mod orders;
pub mod returns;

// Shared row access
pub mod records;
