//! Caller-side stand-ins for handlers on the other end of a channel.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::handler::Handler;
use crate::protocol::Shared;
use crate::value::Arg;

#[derive(Clone)]
pub(crate) enum Target {
    Remote,
    Local(Handler),
}

/// Untyped proxy for a named handler.
///
/// Cheap to clone. A proxy does not keep its protocol alive; once the
/// protocol is closed or dropped every call fails with
/// [`RpcError::ChannelClosed`].
#[derive(Clone)]
pub struct Proxy {
    name: Arc<str>,
    target: Target,
    shared: Weak<Shared>,
}

impl Proxy {
    pub(crate) fn remote(name: Arc<str>, shared: Weak<Shared>) -> Self {
        Self {
            name,
            target: Target::Remote,
            shared,
        }
    }

    pub(crate) fn local(name: Arc<str>, handler: Handler, shared: Weak<Shared>) -> Self {
        Self {
            name,
            target: Target::Local(handler),
            shared,
        }
    }

    /// The proxy identifier name calls are addressed to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when calls are served by a handler registered on this side.
    pub fn is_local(&self) -> bool {
        matches!(self.target, Target::Local(_))
    }

    /// Start a call.
    ///
    /// Arguments are cloned into their wire form before this returns, so
    /// later changes to shared nodes do not affect the call. Fails without
    /// sending anything when the channel is closed or the arguments cannot
    /// be serialized.
    pub fn call(&self, method: &str, args: Vec<Arg>) -> Result<PendingCall> {
        let shared = self.shared.upgrade().ok_or(RpcError::ChannelClosed)?;
        shared.start_call(&self.name, &self.target, method, &args)
    }

    /// Start a call and wait for its result.
    ///
    /// The call is started before the returned future is first polled.
    pub fn invoke(
        &self,
        method: &str,
        args: Vec<Arg>,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let call = self.call(method, args);
        async move { call?.await }
    }

    /// Like [`invoke`](Self::invoke), deserializing the result.
    pub fn invoke_as<T: DeserializeOwned + Send + 'static>(
        &self,
        method: &str,
        args: Vec<Arg>,
    ) -> impl Future<Output = Result<T>> + Send + 'static {
        let call = self.call(method, args);
        async move { call?.decode().await }
    }

    /// Fire-and-forget message; no response is ever produced.
    pub fn notify(&self, method: &str, args: Vec<Arg>) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(RpcError::ChannelClosed)?;
        shared.notify(&self.name, &self.target, method, &args)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("local", &self.is_local())
            .finish()
    }
}

/// Typed wrapper around a [`Proxy`].
///
/// ```
/// use rpcplex_rpc::{FromProxy, Proxy, Result};
///
/// struct MathProxy(Proxy);
///
/// impl FromProxy for MathProxy {
///     fn from_proxy(proxy: Proxy) -> Self {
///         Self(proxy)
///     }
/// }
///
/// impl MathProxy {
///     async fn add(&self, a: i64, b: i64) -> Result<i64> {
///         self.0.invoke_as("add", vec![a.into(), b.into()]).await
///     }
/// }
/// ```
pub trait FromProxy {
    fn from_proxy(proxy: Proxy) -> Self;
}

impl FromProxy for Proxy {
    fn from_proxy(proxy: Proxy) -> Self {
        proxy
    }
}

pub(crate) type Completion = oneshot::Sender<Result<Value>>;

/// An outstanding call.
///
/// Resolves with the call's result. Dropping an unresolved call cancels it.
#[must_use = "dropping a pending call cancels it"]
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
    canceller: CallCanceller,
    settled: bool,
}

impl PendingCall {
    pub(crate) fn new(
        id: u64,
        rx: oneshot::Receiver<Result<Value>>,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            rx,
            canceller: CallCanceller { id, shared },
            settled: false,
        }
    }

    /// Request id of this call.
    pub fn id(&self) -> u64 {
        self.canceller.id
    }

    /// Cancel the call.
    ///
    /// The call resolves with [`RpcError::Cancelled`] and the other side is
    /// told to stop. Returns false if the call had already settled.
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// A handle that can cancel this call from elsewhere.
    pub fn canceller(&self) -> CallCanceller {
        self.canceller.clone()
    }

    /// Wait at most `timeout`; on expiry the call is cancelled and fails
    /// with [`RpcError::Timeout`].
    ///
    /// A result that lands while the timer fires is still returned.
    pub async fn with_timeout(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self).await {
            Ok(result) => result,
            Err(_) => self.expire(timeout).await,
        }
    }

    async fn expire(&mut self, timeout: Duration) -> Result<Value> {
        if self.canceller.cancel() {
            self.settled = true;
            return Err(RpcError::Timeout(timeout));
        }
        // Already settled elsewhere; its completion is sent or dropped.
        self.await
    }

    /// Wait for the result and deserialize it.
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.await?;
        serde_json::from_value(value).map_err(|err| RpcError::Decode(err.to_string()))
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.settled = true;
                // A dropped completion means the protocol went away.
                Poll::Ready(result.unwrap_or(Err(RpcError::ChannelClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled {
            self.canceller.cancel();
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.canceller.id)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Cancels one outstanding call.
#[derive(Debug, Clone)]
pub struct CallCanceller {
    id: u64,
    shared: Weak<Shared>,
}

impl CallCanceller {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true if the call was still outstanding.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel_call(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rpcplex_frame::{Frame, Link, RPC};
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::message::{Message, Outcome};
    use crate::protocol::RpcProtocol;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_request_id(peer: &mut Link) -> u64 {
        let frame = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
        match Message::decode(&frame.payload).unwrap() {
            Message::Request { id, .. } => id,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn expiry_keeps_a_result_that_already_landed() {
        let (link, mut peer) = Link::pair();
        let rpc = RpcProtocol::new(link);

        let mut call = rpc.proxy_for("Math").call("add", vec![]).unwrap();
        let id = next_request_id(&mut peer).await;
        let response = Message::Response {
            id,
            proxy: "Math".into(),
            outcome: Outcome::success(json!(42)),
        };
        peer.send(Frame::new(RPC, response.encode().unwrap()))
            .unwrap();

        timeout(WAIT, async {
            while rpc.pending_calls() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let value = call.expire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(value, json!(42));
    }

    #[tokio::test]
    async fn expiry_cancels_an_outstanding_call() {
        let (link, mut peer) = Link::pair();
        let rpc = RpcProtocol::new(link);

        let call = rpc.proxy_for("Math").call("add", vec![]).unwrap();
        let id = next_request_id(&mut peer).await;

        let err = call
            .with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(rpc.pending_calls(), 0);

        let frame = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
        match Message::decode(&frame.payload).unwrap() {
            Message::Cancel { id: cancelled, .. } => assert_eq!(cancelled, id),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
