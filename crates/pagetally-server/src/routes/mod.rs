pub mod count;
pub mod export;
pub mod health;
