//! Domain layer public interface.
//!
//! Broker-independent abstractions shared by the publish path, the
//! subscribe loop and the transport implementations. Consumers import
//! symbols via this module, not by referencing individual files.

mod transport;

pub use transport::{
    //
    Envelope,
    Subscription,
    SubscriptionHandle,
    Topic,
    Transport,
    TransportPtr,
};
