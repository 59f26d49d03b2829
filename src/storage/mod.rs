mod schema;
mod subscriptions;
mod types;

pub use schema::Database;
pub use types::{
    DatabaseError, FeedItem, NewSubscription, Subscription, SubscriptionField, DURATION_FAILED,
    EPOCH_MIN,
};
