#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{json, Value};

use quorum_net::{
    default_threshold, most_common, resolve, Completion, FanOut, FnCodec, HandshakeRecord,
    NetError, NetworkError, NodeCall, NodeReply, NodeRequest, Transport,
};

struct FailingSet {
    failing: Vec<String>,
}

#[async_trait]
impl Transport for FailingSet {
    async fn send(&self, request: &NodeRequest, _timeout: Duration) -> Result<NodeReply, NetworkError> {
        if self.failing.contains(&request.url) {
            Err(NetworkError::connection(&request.url, "down"))
        } else {
            Ok(NodeReply::Accepted(json!({"url": request.url})))
        }
    }
}

fn record(network_key: &str) -> HandshakeRecord {
    HandshakeRecord {
        server_public_key: "aa".into(),
        subnet_public_key: Some("subnet".into()),
        network_public_key: Some(network_key.into()),
        network_public_key_set: Some("set".into()),
        hd_root_pubkeys: vec![],
        latest_blockhash: Some("0x1".into()),
        node_version: None,
        epoch: Some(1),
    }
}

fn run<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn strict_majority_wins(
        minority in 0usize..20,
        extra in 1usize..20,
        order in any::<u64>(),
    ) {
        let majority = minority + extra;
        let mut records: Vec<HandshakeRecord> = (0..majority).map(|_| record("K1")).collect();
        records.extend((0..minority).map(|_| record("K2")));
        // Deterministic shuffle so the adversary can be seen first.
        let len = records.len();
        records.rotate_left((order as usize) % len);

        let config = resolve(&records).unwrap();
        prop_assert_eq!(config.network_pub_key.as_deref(), Some("K1"));
    }

    #[test]
    fn most_common_returns_a_member(values in prop::collection::vec(0u8..5, 1..50)) {
        let winner = most_common(values.iter().copied()).unwrap();
        let count = |v: u8| values.iter().filter(|x| **x == v).count();
        prop_assert!(values.contains(&winner));
        prop_assert!((0u8..5).all(|v| count(v) <= count(winner)));
    }

    #[test]
    fn quorum_met_iff_enough_succeed(
        n in 1usize..8,
        failing_mask in any::<u8>(),
        k_seed in any::<usize>(),
        early in any::<bool>(),
    ) {
        let nodes: Vec<String> = (0..n).map(|i| format!("https://n{i}")).collect();
        let failing: Vec<String> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| failing_mask & (1 << i) != 0)
            .map(|(_, url)| url.clone())
            .collect();
        let healthy = n - failing.len();
        let k = k_seed % (n + 1);
        let completion = if early { Completion::EarlyCancel } else { Completion::WaitAll };

        let fanout = FanOut::new(Arc::new(FailingSet { failing }));
        let codec = FnCodec::new(
            |_: &str| Ok(NodeCall::new("/op", Value::Null)),
            |_: &str, body: Value| Ok(body),
        );
        let result = run(fanout.fan_out(&nodes, k, completion, &codec));

        if healthy >= k {
            let outcome = result.unwrap();
            prop_assert!(outcome.succeeded.len() >= k);
            if !early {
                prop_assert_eq!(outcome.succeeded.len(), healthy);
                prop_assert_eq!(outcome.failed.len(), n - healthy);
            }
        } else {
            match result {
                Err(NetError::QuorumNotMet { required, succeeded, .. }) => {
                    prop_assert_eq!(required, k);
                    prop_assert!(succeeded < k);
                }
                other => prop_assert!(false, "expected QuorumNotMet, got {:?}", other.map(|o| o.succeeded.len())),
            }
        }
    }

    #[test]
    fn default_threshold_bounds(n in 0usize..1000) {
        let t = default_threshold(n);
        prop_assert!(t >= 3);
        prop_assert!(t >= n * 2 / 3);
    }
}
