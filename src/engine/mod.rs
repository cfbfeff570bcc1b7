pub mod fare;
pub mod ledger;
pub mod lifecycle;
pub mod otp;
pub mod settlement;
