//! Order and payment reconciliation backend for the crochet shop.
//!
//! Orders are placed through checkout, a 20% deposit is collected through an
//! M-PESA STK push, and payment results arriving from the gateway callback or
//! from client polling are merged into order state by a single
//! reconciliation engine.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
