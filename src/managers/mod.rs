pub mod backup;
pub mod credentials;
pub mod discovery;
pub mod logging;
pub mod retention;
pub mod service_backup;
pub mod status;
