mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::{MockUpstream, a_response, query_packet};
use rankdns::ProxyError;
use rankdns::forwarder::{FAILURE_PENALTY, Forwarder};
use rankdns::rating::{RatingStore, UpstreamSeed};

const TIMEOUT: Duration = Duration::from_millis(200);

async fn forwarder_for(upstreams: &[&MockUpstream]) -> Forwarder {
    let seeds: Vec<_> = upstreams
        .iter()
        .enumerate()
        .map(|(i, upstream)| UpstreamSeed::new(format!("mock-{}", i), upstream.address()))
        .collect();
    let ratings = RatingStore::open("sqlite::memory:", &seeds).await.unwrap();
    Forwarder::new(Arc::new(ratings), TIMEOUT, 53)
}

async fn score_of(forwarder: &Forwarder, upstream: &MockUpstream) -> f64 {
    forwarder
        .ratings()
        .best(16)
        .await
        .unwrap()
        .into_iter()
        .find(|candidate| candidate.ip == upstream.address())
        .map(|candidate| candidate.score)
        .unwrap()
}

#[tokio::test]
async fn first_upstream_answers() {
    let good = MockUpstream::answering(Ipv4Addr::new(93, 184, 216, 34), 300).await;
    let spare = MockUpstream::silent().await;
    let forwarder = forwarder_for(&[&good, &spare]).await;

    let reply = forwarder.forward(&query_packet(7, "example.com", 1)).await.unwrap();

    assert_eq!(reply.attempts, 1);
    assert_eq!(reply.upstream.name, "mock-0");
    assert_eq!(reply.response.id, 7);
    assert_eq!(reply.response.answers[0].data_text().unwrap(), "93.184.216.34");
    assert_eq!(good.hits(), 1);
    assert_eq!(spare.hits(), 0);

    let score = score_of(&forwarder, &good).await;
    assert!(score > 0.0 && score < TIMEOUT.as_secs_f64());
}

#[tokio::test]
async fn nth_upstream_answers_after_penalizing_earlier_ones() {
    let first = MockUpstream::silent().await;
    let second = MockUpstream::silent().await;
    let third = MockUpstream::answering(Ipv4Addr::new(10, 1, 2, 3), 60).await;
    let forwarder = forwarder_for(&[&first, &second, &third]).await;

    let reply = forwarder.forward(&query_packet(9, "example.org", 1)).await.unwrap();

    assert_eq!(reply.attempts, 3);
    assert_eq!(reply.upstream.ip, third.address());
    assert_eq!((first.hits(), second.hits(), third.hits()), (1, 1, 1));
    assert_eq!(score_of(&forwarder, &first).await, FAILURE_PENALTY);
    assert_eq!(score_of(&forwarder, &second).await, FAILURE_PENALTY);
    assert!(score_of(&forwarder, &third).await < FAILURE_PENALTY);
}

#[tokio::test]
async fn all_upstreams_timing_out_fails_after_one_attempt_each() {
    let upstreams = [
        MockUpstream::silent().await,
        MockUpstream::silent().await,
        MockUpstream::silent().await,
    ];
    let forwarder = forwarder_for(&upstreams.iter().collect::<Vec<_>>()).await;

    let err = forwarder
        .forward(&query_packet(1, "example.com", 1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProxyError::UpstreamLookupFailure {
            attempts: 3,
            last_reply: None
        }
    ));
    for upstream in &upstreams {
        assert_eq!(upstream.hits(), 1);
        assert_eq!(score_of(&forwarder, upstream).await, FAILURE_PENALTY);
    }
}

#[tokio::test]
async fn unusable_reply_is_kept_as_last_reply() {
    // Echoes the query back: parses as a query, not a response
    let echo = MockUpstream::start(Duration::ZERO, |query| Some(query.to_vec())).await;
    let forwarder = forwarder_for(&[&echo]).await;
    let query = query_packet(3, "example.com", 1);

    let err = forwarder.forward(&query).await.unwrap_err();

    match err {
        ProxyError::UpstreamLookupFailure {
            attempts,
            last_reply,
        } => {
            assert_eq!(attempts, 1);
            assert_eq!(last_reply, Some(query));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(score_of(&forwarder, &echo).await, FAILURE_PENALTY);
}

#[tokio::test]
async fn reply_with_foreign_id_is_a_failure() {
    let liar = MockUpstream::start(Duration::ZERO, |query| {
        let mut response = a_response(query, Ipv4Addr::new(1, 2, 3, 4), 60);
        response[0] ^= 0xFF;
        Some(response)
    })
    .await;
    let honest = MockUpstream::answering(Ipv4Addr::new(5, 6, 7, 8), 60).await;
    let forwarder = forwarder_for(&[&liar, &honest]).await;

    let reply = forwarder.forward(&query_packet(0x0101, "example.com", 1)).await.unwrap();

    assert_eq!(reply.attempts, 2);
    assert_eq!(reply.response.answers[0].data_text().unwrap(), "5.6.7.8");
    assert_eq!(score_of(&forwarder, &liar).await, FAILURE_PENALTY);
}

#[tokio::test]
async fn penalties_accumulate_across_requests() {
    let flaky = MockUpstream::silent().await;
    let forwarder = forwarder_for(&[&flaky]).await;

    for id in 0..3 {
        let _ = forwarder.forward(&query_packet(id, "example.com", 1)).await;
    }

    let score = score_of(&forwarder, &flaky).await;
    assert!((score - 3.0 * FAILURE_PENALTY).abs() < 1e-9);
}
