#![forbid(unsafe_code)]

pub mod connection;
pub mod health;
pub mod history;
pub mod http;
pub mod hub;
pub mod identity;
pub mod ingest;
pub mod profiles;
pub mod store;

#[cfg(test)]
mod test_support;




#[cfg(test)]
mod ws_smoke_tests;
