pub mod address;
pub mod command;
pub mod intent;
pub mod models;
pub mod settings;

pub use address::{DeviceAddress, InvalidAddress};
pub use command::DispenserCommand;
pub use intent::ActiveCommand;
pub use models::ConnectionState;
