// Exchange REST clients
pub mod bithumb;

pub use bithumb::BithumbClient;
