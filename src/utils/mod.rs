pub mod logging;
pub mod signing;
pub mod tls;
pub mod types;
