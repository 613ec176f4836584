use serde::Serialize;
use serde::de::DeserializeOwned;

use civitas_core::AggregateRef;

/// A named domain fact.
///
/// Events are:
/// - **immutable** once appended to the outbox
/// - identified on the wire by [`Event::NAME`], which policies subscribe to
/// - serialized as JSON into the outbox payload column
pub trait Event: Serialize + DeserializeOwned + Send + 'static {
    /// Stable event name (e.g. "ThreadCreated").
    const NAME: &'static str;

    /// Aggregate the event originated from.
    fn aggregate(&self) -> AggregateRef;
}
