//! The dispatch walk.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tracing::warn;

use super::{DispatchError, HandlerKind, Lookup, Loopback, Path, Sign};
use crate::envelope::Kwargs;

/// A node of the dispatch tree.
///
/// A node declares its handlers through [`lookup`](Node::lookup) and runs
/// them through [`receive`](Node::receive) and [`route`](Node::route); the
/// engine owns the walk, the topology checks and the authority checks.
/// `receive`/`route` are only ever called with names `lookup` reported as
/// handlers of the matching kind.
#[async_trait]
pub trait Node: Send + Sync {
    /// Name used in error messages, e.g. `"root"`.
    fn node_name(&self) -> &'static str;

    /// The handler table.
    fn lookup(&self, name: &str) -> Lookup;

    /// Runs the receiver registered under `name`.
    async fn receive(&self, name: &str, kwargs: Kwargs) -> Result<(), DispatchError>;

    /// Runs the router registered under `name`. The router must await
    /// `next` exactly once; code may run after the child dispatch
    /// completes.
    async fn route(
        &self,
        name: &str,
        next: Next<'_>,
        kwargs: Kwargs,
    ) -> Result<(), DispatchError> {
        let _ = (name, next, kwargs);
        unreachable!("lookup() reported a router this node does not implement")
    }

    /// The catch-all for unresolved segments, if this node is a proxy.
    fn proxy(&self) -> Option<&dyn Proxy> {
        None
    }
}

/// Catch-all for path suffixes a proxy node forwards elsewhere.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Handles the unresolved suffix of the path together with the
    /// caller's sign and kwargs.
    async fn forward(&self, rest: Path, sign: Sign, kwargs: Kwargs) -> Result<(), DispatchError>;
}

/// Continuation handed to a router: the rest of the path.
pub struct Next<'a> {
    path: &'a Path,
    index: usize,
    sign: Sign,
}

impl Next<'_> {
    /// Sign of the dispatch being continued.
    pub fn sign(&self) -> Sign {
        self.sign
    }

    /// Continues dispatch on `node` with the next path segment.
    pub async fn step(self, node: &dyn Node, kwargs: Kwargs) -> Result<(), DispatchError> {
        dispatch_at(node, self.path, self.index, kwargs, self.sign).await
    }
}

/// Dispatches `path` on `root` with the authority of `sign`.
pub async fn dispatch(
    root: &dyn Node,
    path: &Path,
    kwargs: Kwargs,
    sign: Sign,
) -> Result<(), DispatchError> {
    dispatch_at(root, path, 0, kwargs, sign).await
}

/// Dispatches `path` on `root`, then drains the root's [`Loopback`] queue.
///
/// Queued entries run with [`Sign::Internal`], in enqueue order, strictly
/// after the triggering frame unwinds and before the caller handles its
/// next event. Entries enqueued by a loopback dispatch run in the same
/// drain. If the triggering dispatch failed, the queue is discarded; a
/// failing loopback entry is logged and does not stop the drain.
pub async fn dispatch_with_loopback(
    root: &dyn Node,
    loopback: &Loopback,
    path: &Path,
    kwargs: Kwargs,
    sign: Sign,
) -> Result<(), DispatchError> {
    let result = dispatch(root, path, kwargs, sign).await;
    if result.is_err() {
        loopback.clear();
        return result;
    }
    loop {
        let batch = loopback.drain();
        if batch.is_empty() {
            break;
        }
        for (deferred, kwargs) in batch {
            let path = Path::parse(&deferred);
            if let Err(error) = dispatch(root, &path, kwargs, Sign::Internal).await {
                warn!(path = %path, %error, "loopback dispatch failed");
            }
        }
    }
    result
}

fn dispatch_at<'a>(
    node: &'a dyn Node,
    path: &'a Path,
    index: usize,
    kwargs: Kwargs,
    sign: Sign,
) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
    Box::pin(async move {
        let name = path.segment(index);
        let last = index + 1 == path.len();
        let annotated = || path.annotate(index);

        let (kind, access) = match node.lookup(name) {
            Lookup::Handler(kind, access) => (kind, access),
            Lookup::Forbidden => {
                return Err(DispatchError::Forbidden {
                    node: node.node_name(),
                    name: name.to_owned(),
                    path: annotated(),
                });
            }
            Lookup::Unknown => {
                if let Some(proxy) = node.proxy() {
                    return proxy
                        .forward(path.suffix(index), sign, kwargs)
                        .await
                        .map_err(|error| error.locate(&annotated()));
                }
                return Err(DispatchError::NoSuchMember {
                    node: node.node_name(),
                    name: name.to_owned(),
                    path: annotated(),
                });
            }
        };

        match kind {
            HandlerKind::Receiver if !last => {
                return Err(DispatchError::ExpectedRouter {
                    node: node.node_name(),
                    name: name.to_owned(),
                    path: annotated(),
                });
            }
            HandlerKind::Router if last => {
                return Err(DispatchError::ExpectedReceiver {
                    node: node.node_name(),
                    name: name.to_owned(),
                    path: annotated(),
                });
            }
            _ => {}
        }

        if !access.admits(sign) {
            return Err(DispatchError::SignDenied {
                required: access,
                path: annotated(),
            });
        }

        match kind {
            HandlerKind::Receiver => node
                .receive(name, kwargs)
                .await
                .map_err(|error| error.locate(&annotated())),
            HandlerKind::Router => {
                let next = Next {
                    path,
                    index: index + 1,
                    sign,
                };
                node.route(name, next, kwargs)
                    .await
                    .map_err(|error| error.locate(&annotated()))
            }
        }
    })
}
