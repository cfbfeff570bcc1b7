pub mod driver;
pub mod job;
pub mod ledger;
pub mod notification;
pub mod payment;
pub mod rates;
