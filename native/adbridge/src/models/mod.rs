mod device;
pub use device::*;
mod input;
pub use input::*;
mod log_record;
pub use log_record::*;
mod settings;
pub use settings::*;
mod transfer;
pub use transfer::*;
