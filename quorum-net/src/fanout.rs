// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{FailureReason, NetError, NodeFailure, Result};
use crate::protocol::rejection_message;
use crate::transport::{generate_request_id, NodeReply, NodeRequest, Transport, DEFAULT_REQUEST_TIMEOUT};

/// What to send to one node.
#[derive(Debug, Clone)]
pub struct NodeCall {
    pub path: String,
    pub body: Value,
}

impl NodeCall {
    pub fn new(path: &str, body: Value) -> Self {
        Self {
            path: path.to_string(),
            body,
        }
    }
}

/// Builds each node's request and turns its reply into a typed result.
pub trait NodeCodec: Sync {
    type Output: Send;

    fn build(&self, url: &str) -> std::result::Result<NodeCall, String>;

    fn decode(&self, url: &str, body: Value) -> std::result::Result<Self::Output, FailureReason>;

    fn rejected(&self, _url: &str, status: u16, body: Option<Value>) -> FailureReason {
        FailureReason::Rejected {
            status,
            message: rejection_message(status, body.as_ref()),
        }
    }
}

/// A codec made of two closures.
pub struct FnCodec<T, B, D> {
    build: B,
    decode: D,
    _output: PhantomData<fn() -> T>,
}

impl<T, B, D> FnCodec<T, B, D>
where
    B: Fn(&str) -> std::result::Result<NodeCall, String> + Sync,
    D: Fn(&str, Value) -> std::result::Result<T, FailureReason> + Sync,
{
    pub fn new(build: B, decode: D) -> Self {
        Self {
            build,
            decode,
            _output: PhantomData,
        }
    }
}

impl<T, B, D> NodeCodec for FnCodec<T, B, D>
where
    T: Send,
    B: Fn(&str) -> std::result::Result<NodeCall, String> + Sync,
    D: Fn(&str, Value) -> std::result::Result<T, FailureReason> + Sync,
{
    type Output = T;

    fn build(&self, url: &str) -> std::result::Result<NodeCall, String> {
        (self.build)(url)
    }

    fn decode(&self, url: &str, body: Value) -> std::result::Result<T, FailureReason> {
        (self.decode)(url, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// Wait for every node so failures are fully reported.
    #[default]
    WaitAll,
    /// Stop once the outcome is decided and drop the remaining calls.
    EarlyCancel,
}

#[derive(Debug)]
pub struct FanOutOutcome<T> {
    pub request_id: String,
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<NodeFailure>,
    pub cancelled: Vec<String>,
}

impl<T> FanOutOutcome<T> {
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.succeeded.iter().map(|(_, v)| v)
    }

    pub fn into_values(self) -> Vec<T> {
        self.succeeded.into_iter().map(|(_, v)| v).collect()
    }
}

#[derive(Clone)]
pub struct FanOut {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl FanOut {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call<C: NodeCodec>(
        &self,
        url: &str,
        request_id: &str,
        codec: &C,
    ) -> std::result::Result<C::Output, FailureReason> {
        let call = codec.build(url).map_err(FailureReason::Request)?;
        let request = NodeRequest::new(url, &call.path, call.body, request_id);
        match self.transport.send(&request, self.timeout).await {
            Ok(NodeReply::Accepted(body)) => codec.decode(url, body),
            Ok(NodeReply::Rejected { status, body }) => Err(codec.rejected(url, status, body)),
            Err(e) => Err(FailureReason::Network(e)),
        }
    }

    /// Sends one request per node concurrently. Succeeds when at least
    /// `min_success` nodes produced a decoded result; results keep node order.
    pub async fn fan_out<C: NodeCodec>(
        &self,
        nodes: &[String],
        min_success: usize,
        completion: Completion,
        codec: &C,
    ) -> Result<FanOutOutcome<C::Output>> {
        let request_id = generate_request_id();
        debug!(
            request_id = %request_id,
            nodes = nodes.len(),
            min_success,
            "Fanning out request"
        );

        let mut pending: FuturesUnordered<_> = nodes
            .iter()
            .enumerate()
            .map(|(index, url)| {
                let request_id = request_id.as_str();
                async move { (index, self.call(url, request_id, codec).await) }
            })
            .collect();

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        while let Some((index, result)) = pending.next().await {
            let url = &nodes[index];
            match result {
                Ok(value) => succeeded.push((index, value)),
                Err(reason) => {
                    warn!(
                        request_id = %request_id,
                        url = %url,
                        kind = reason.kind(),
                        error = %reason,
                        "Node failed"
                    );
                    failed.push((index, reason));
                }
            }

            if completion == Completion::EarlyCancel {
                let decided = succeeded.len() >= min_success
                    || succeeded.len() + pending.len() < min_success;
                if decided {
                    break;
                }
            }
        }

        let cancelled: Vec<String> = if pending.is_empty() {
            Vec::new()
        } else {
            let mut done: Vec<usize> = succeeded
                .iter()
                .map(|(i, _)| *i)
                .chain(failed.iter().map(|(i, _)| *i))
                .collect();
            done.sort_unstable();
            (0..nodes.len())
                .filter(|i| done.binary_search(i).is_err())
                .map(|i| nodes[i].clone())
                .collect()
        };
        drop(pending);

        succeeded.sort_by_key(|(i, _)| *i);
        failed.sort_by_key(|(i, _)| *i);
        let succeeded: Vec<(String, C::Output)> = succeeded
            .into_iter()
            .map(|(i, v)| (nodes[i].clone(), v))
            .collect();
        let failed: Vec<NodeFailure> = failed
            .into_iter()
            .map(|(i, reason)| NodeFailure {
                url: nodes[i].clone(),
                reason,
            })
            .collect();

        if succeeded.len() < min_success {
            warn!(
                request_id = %request_id,
                required = min_success,
                succeeded = succeeded.len(),
                failed = failed.len(),
                "Quorum not met"
            );
            return Err(NetError::QuorumNotMet {
                request_id,
                required: min_success,
                succeeded: succeeded.len(),
                failures: failed,
            });
        }

        info!(
            request_id = %request_id,
            succeeded = succeeded.len(),
            failed = failed.len(),
            cancelled = cancelled.len(),
            "Fan-out complete"
        );
        Ok(FanOutOutcome {
            request_id,
            succeeded,
            failed,
            cancelled,
        })
    }
}
