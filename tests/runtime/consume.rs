//! Consume-path scenarios.

use std::time::Duration;

use kafka_mux::{Client, Config, Consumer, Error, OFFSET_EARLIEST};
use kafka_mux_wire::KafkaCode;

use crate::broker::Cluster;
use crate::{init_tracing, test_config};

type Collected = (i64, Option<Vec<u8>>, Option<Vec<u8>>);

async fn collect(consumer: &mut Consumer, n: usize) -> Vec<Collected> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let message = tokio::time::timeout(Duration::from_secs(5), consumer.next_message())
            .await
            .expect("timed out waiting for a message")
            .expect("next_message failed");
        out.push((
            message.offset,
            message.key.map(<[u8]>::to_vec),
            message.value.map(<[u8]>::to_vec),
        ));
    }
    out
}

#[tokio::test]
async fn single_consumer_happy_path() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0], 0, 17);
    for value in [b"first".as_slice(), b"second", b"third"] {
        cluster.append("t", 0, Some(b"k"), value);
    }

    let client = Client::connect(cluster.bootstrap(), "happy-path", test_config()).await?;
    let mut consumer = Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;

    let messages = collect(&mut consumer, 3).await;
    assert_eq!(
        messages,
        vec![
            (17, Some(b"k".to_vec()), Some(b"first".to_vec())),
            (18, Some(b"k".to_vec()), Some(b"second".to_vec())),
            (19, Some(b"k".to_vec()), Some(b"third".to_vec())),
        ]
    );
    assert_eq!(consumer.offset(), 20);

    // the fetch cycle keeps running: a later append arrives on its own
    cluster.append("t", 0, None, b"fourth");
    let messages = collect(&mut consumer, 1).await;
    assert_eq!(messages[0].0, 20);
    assert_eq!(messages[0].1, None);
    assert_eq!(messages[0].2, Some(b"fourth".to_vec()));
    Ok(())
}

#[tokio::test]
async fn offsets_strictly_increase_across_buffer_refills() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0], 0, 0);
    for i in 0..50 {
        cluster.append("t", 0, None, format!("msg-{i:02}").as_bytes());
    }

    // small buffers so the 50 messages span several fills and the ring
    // recycles
    let config = Config {
        consumer_max_bytes: 256,
        ..test_config()
    };
    let client = Client::connect(cluster.bootstrap(), "refills", config).await?;
    let mut consumer = Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;

    let messages = collect(&mut consumer, 50).await;
    for (i, (offset, _, value)) in messages.iter().enumerate() {
        assert_eq!(*offset, i as i64);
        assert_eq!(value.as_deref(), Some(format!("msg-{i:02}").as_bytes()));
    }
    Ok(())
}

#[tokio::test]
async fn duplicate_consumer_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0, 1], 0, 0);

    let client = Client::connect(cluster.bootstrap(), "dup", test_config()).await?;
    let consumer = Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;
    assert!(matches!(
        Consumer::new(&client, "t", 0, OFFSET_EARLIEST).unwrap_err(),
        Error::DuplicateWorker { .. }
    ));

    // a different partition is fine, and so is re-registering after drop
    let _other = Consumer::new(&client, "t", 1, OFFSET_EARLIEST);
    drop(consumer);
    Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;
    Ok(())
}

#[tokio::test]
async fn crc_failure_is_retryable_without_losing_position() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0], 0, 0);
    cluster.serve_corrupt_fetch("t", 0);

    let client = Client::connect(cluster.bootstrap(), "crc", test_config()).await?;
    let mut consumer = Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;

    let first = tokio::time::timeout(Duration::from_secs(5), consumer.next_message())
        .await
        .expect("timed out")
        .unwrap_err();
    assert!(matches!(first, Error::Crc { .. }));

    // the cursor has not moved past the bad record: retry sees it again
    let second = consumer.next_message().await.unwrap_err();
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn offset_out_of_range_fails_only_that_consumer() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0, 1], 0, 0);
    cluster.append("t", 1, None, b"healthy");

    let client = Client::connect(cluster.bootstrap(), "oor", test_config()).await?;
    let mut bad = Consumer::new(&client, "t", 0, 1_000_000)?;
    let mut good = Consumer::new(&client, "t", 1, OFFSET_EARLIEST)?;

    let error = tokio::time::timeout(Duration::from_secs(5), bad.next_message())
        .await
        .expect("timed out")
        .unwrap_err();
    assert!(matches!(error, Error::OffsetOutOfRange { .. }));

    // the error is sticky for the failed consumer
    assert!(matches!(
        bad.next_message().await.unwrap_err(),
        Error::OffsetOutOfRange { .. }
    ));

    // the other consumer on the same connection is unaffected
    let messages = collect(&mut good, 1).await;
    assert_eq!(messages[0].2, Some(b"healthy".to_vec()));
    Ok(())
}

#[tokio::test]
async fn bundled_fetch_covers_all_ready_partitions() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0, 1], 0, 0);
    cluster.append("t", 0, None, b"p0");
    cluster.append("t", 1, None, b"p1");

    let config = Config {
        fetcher_bundle_min_requests: 2,
        fetcher_bundle_max_wait: Duration::from_millis(500),
        ..test_config()
    };
    let client = Client::connect(cluster.bootstrap(), "bundle", config).await?;
    let mut c0 = Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;
    let mut c1 = Consumer::new(&client, "t", 1, OFFSET_EARLIEST)?;

    assert_eq!(collect(&mut c0, 1).await[0].2, Some(b"p0".to_vec()));
    assert_eq!(collect(&mut c1, 1).await[0].2, Some(b"p1".to_vec()));

    // both partitions were ready before the bundle min was met, so the
    // first RPC on the wire covered them together
    assert_eq!(cluster.fetch_partition_counts(0)[0], 2);
    Ok(())
}

#[tokio::test]
async fn undersized_bundle_flushes_after_max_wait() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0], 0, 0);
    cluster.append("t", 0, None, b"solo");

    // min can never be met with one partition; only the wait budget flushes
    let config = Config {
        fetcher_bundle_min_requests: 3,
        fetcher_bundle_max_wait: Duration::from_millis(50),
        ..test_config()
    };
    let client = Client::connect(cluster.bootstrap(), "waitmax", config).await?;
    let mut consumer = Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;

    let messages = collect(&mut consumer, 1).await;
    assert_eq!(messages[0].2, Some(b"solo".to_vec()));
    assert_eq!(cluster.fetch_partition_counts(0)[0], 1);
    Ok(())
}

#[tokio::test]
async fn unexpected_error_code_tears_the_connection_down_and_recovers() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("t", &[0], 0, 0);
    cluster.append("t", 0, None, b"before");
    cluster.fail_next_fetch("t", 0, KafkaCode::Other(87), 1);

    let client = Client::connect(cluster.bootstrap(), "protocol", test_config()).await?;
    let mut consumer = Consumer::new(&client, "t", 0, OFFSET_EARLIEST)?;

    // the protocol failure kills the connection; the worker re-homes onto a
    // fresh one and consumption proceeds
    let messages = collect(&mut consumer, 1).await;
    assert_eq!(messages[0].2, Some(b"before".to_vec()));
    Ok(())
}

#[tokio::test]
async fn topics_and_partitions_come_from_cached_metadata() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start(1).await?;
    cluster.create_topic("alpha", &[0, 1, 2], 0, 0);
    cluster.create_topic("beta", &[0], 0, 0);

    let client = Client::connect(cluster.bootstrap(), "listing", test_config()).await?;
    assert_eq!(client.topics(), vec!["alpha".to_string(), "beta".to_string()]);
    assert_eq!(client.partitions("alpha")?, vec![0, 1, 2]);
    assert!(matches!(
        client.partitions("missing").unwrap_err(),
        Error::UnknownTopic(_)
    ));
    Ok(())
}
