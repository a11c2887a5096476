// Typed publish/subscribe façade over the core client.
//
// An [`Encoder`] converts between Rust values and payload bytes; the
// façade never interprets payloads itself. The encoder is injected at
// construction, so swapping serialization formats touches no other code.
// Callback shapes form a small closed set ([`Handler`]) chosen explicitly
// by the caller.
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tern_client::{Client, Message, Subscription};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Client(#[from] tern_client::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Converts typed values to and from payload bytes. The subject is passed
/// through so an encoder may vary its format per subject.
pub trait Encoder: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, subject: &str, value: &T)
    -> std::result::Result<Vec<u8>, CodecError>;
    fn decode<T: DeserializeOwned>(
        &self,
        subject: &str,
        data: &[u8],
    ) -> std::result::Result<T, CodecError>;
}

/// Built-in JSON encoder.
///
/// ```
/// use tern_codec::{Encoder, JsonEncoder};
///
/// let value = vec![1u32, 2, 3];
/// let bytes = JsonEncoder.encode("subject", &value).expect("encode");
/// let back: Vec<u32> = JsonEncoder.decode("subject", &bytes).expect("decode");
/// assert_eq!(back, value);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode<T: Serialize>(
        &self,
        _subject: &str,
        value: &T,
    ) -> std::result::Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(
        &self,
        _subject: &str,
        data: &[u8],
    ) -> std::result::Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

/// The callback shapes a typed subscription supports. Each variant maps
/// to one call signature; the caller picks the one it wants instead of
/// the library inferring it.
pub enum Handler<T> {
    /// Decoded value only.
    Payload(Box<dyn Fn(T) + Send + Sync>),
    /// Subject and decoded value.
    Subject(Box<dyn Fn(&str, T) + Send + Sync>),
    /// Subject, optional reply, decoded value.
    SubjectReply(Box<dyn Fn(&str, Option<&str>, T) + Send + Sync>),
    /// The raw message, undecoded.
    Raw(Box<dyn Fn(Message) + Send + Sync>),
}

/// Typed wrapper around a [`Client`].
pub struct TypedClient<E: Encoder = JsonEncoder> {
    client: Client,
    encoder: Arc<E>,
}

impl TypedClient<JsonEncoder> {
    /// A typed client speaking JSON payloads.
    pub fn json(client: Client) -> Self {
        Self::new(client, JsonEncoder)
    }
}

impl<E: Encoder> TypedClient<E> {
    pub fn new(client: Client, encoder: E) -> Self {
        Self {
            client,
            encoder: Arc::new(encoder),
        }
    }

    /// The underlying connection, for untyped operations and lifecycle
    /// control.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn publish<T: Serialize>(&self, subject: &str, value: &T) -> Result<()> {
        let bytes = self.encoder.encode(subject, value)?;
        self.client.publish(subject, &bytes)?;
        Ok(())
    }

    pub fn publish_request<T: Serialize>(
        &self,
        subject: &str,
        reply: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = self.encoder.encode(subject, value)?;
        self.client.publish_request(subject, reply, &bytes)?;
        Ok(())
    }

    /// Typed request/reply: encode the request, wait for the first reply,
    /// decode it.
    pub async fn request<T, R>(&self, subject: &str, value: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let bytes = self.encoder.encode(subject, value)?;
        let reply = self.client.request(subject, &bytes, timeout).await?;
        let decoded = self.encoder.decode(&reply.subject, &reply.payload)?;
        Ok(decoded)
    }

    /// Typed subscription. Decode failures never reach the handler; they
    /// are routed to the connection's async-error callback instead.
    pub fn subscribe_with<T>(&self, subject: &str, handler: Handler<T>) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.subscribe_handler(subject, None, handler)
    }

    pub fn queue_subscribe_with<T>(
        &self,
        subject: &str,
        queue: &str,
        handler: Handler<T>,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.subscribe_handler(subject, Some(queue), handler)
    }

    fn subscribe_handler<T>(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: Handler<T>,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let encoder = Arc::clone(&self.encoder);
        let client = self.client.clone();
        let callback = move |msg: Message| match &handler {
            Handler::Raw(f) => f(msg),
            Handler::Payload(f) => {
                match encoder.decode::<T>(&msg.subject, &msg.payload) {
                    Ok(value) => f(value),
                    Err(err) => client.notify_async_error(decode_error(&err)),
                }
            }
            Handler::Subject(f) => {
                match encoder.decode::<T>(&msg.subject, &msg.payload) {
                    Ok(value) => f(&msg.subject, value),
                    Err(err) => client.notify_async_error(decode_error(&err)),
                }
            }
            Handler::SubjectReply(f) => {
                match encoder.decode::<T>(&msg.subject, &msg.payload) {
                    Ok(value) => f(&msg.subject, msg.reply.as_deref(), value),
                    Err(err) => client.notify_async_error(decode_error(&err)),
                }
            }
        };
        let sub = match queue {
            Some(queue) => self.client.queue_subscribe(subject, queue, callback)?,
            None => self.client.subscribe(subject, callback)?,
        };
        Ok(sub)
    }
}

fn decode_error(err: &CodecError) -> tern_client::Error {
    tern_client::Error::Decode(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        item: String,
    }

    #[test]
    fn json_encoder_round_trips_structs() {
        let order = Order {
            id: 9,
            item: "wrench".to_string(),
        };
        let bytes = JsonEncoder.encode("orders", &order).expect("encode");
        let back: Order = JsonEncoder.decode("orders", &bytes).expect("decode");
        assert_eq!(back, order);
    }

    #[test]
    fn json_encoder_reports_decode_failures() {
        let err = JsonEncoder
            .decode::<Order>("orders", b"not json")
            .expect_err("garbage");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().starts_with("decode failed"));
    }

    #[test]
    fn handler_variants_capture_their_shapes() {
        // Compile-time shape check: each variant accepts its closure form.
        let _payload: Handler<Order> = Handler::Payload(Box::new(|_order| {}));
        let _subject: Handler<Order> = Handler::Subject(Box::new(|_subject, _order| {}));
        let _both: Handler<Order> =
            Handler::SubjectReply(Box::new(|_subject, _reply, _order| {}));
        let _raw: Handler<Order> = Handler::Raw(Box::new(|_msg| {}));
    }
}
