pub mod address_store;
pub mod bluetooth;
pub mod logging;
