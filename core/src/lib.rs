pub mod card;
pub mod credential;
pub mod dashboard;
pub mod error;
pub mod query;

pub use credential::Credential;
pub use error::{Error, Result};
