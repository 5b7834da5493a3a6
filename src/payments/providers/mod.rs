pub mod mpesa;

pub use mpesa::{MpesaClient, MpesaConfig};
