pub mod hub;

pub use hub::{HubStats, NotificationHub, Subscription};
