//! Simple broker example with a self-contained publisher and subscriber
//!
//! Run with: cargo run --example simple_broker [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example simple_broker                  # binds to 127.0.0.1:7721
//!   cargo run --example simple_broker 0.0.0.0:7900     # custom address
//!
//! The example starts the broker, publishes a moving test pattern on the
//! source `pattern` as jpeg, and subscribes one raw stream to it, printing
//! delivery stats once per second. Any other client can attach its own
//! streams to `pattern` while it runs.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use framebroker::client::{Connection, SourceHandle, StreamHandle};
use framebroker::{BrokerConfig, BrokerServer, Frame, FrameProperties, PixelDepth};

fn pattern(props: FrameProperties, tick: u32) -> Frame {
    let mut data = Vec::with_capacity(props.frame_size());
    for y in 0..props.height {
        for x in 0..props.width {
            let band = (x + tick) % props.width;
            data.push((band * 255 / props.width) as u8);
            data.push((y * 255 / props.height) as u8);
            data.push(((tick * 3) % 255) as u8);
        }
    }
    Frame::new(props, Bytes::from(data)).expect("pattern matches its shape")
}

#[tokio::main]
async fn main() -> framebroker::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7721".to_string())
        .parse()
        .expect("bind address");

    let broker = BrokerServer::new(BrokerConfig::with_addr(addr));
    tokio::spawn(async move {
        if let Err(e) = broker.run().await {
            tracing::error!(error = %e, "broker stopped");
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let props = FrameProperties::new(320, 240, PixelDepth::U8, 3);

    // publisher: 25 fps test pattern, jpeg-encoded at the edge
    let publisher = Connection::connect(addr).await?;
    let mut source = SourceHandle::open(&publisher, "pattern").await?;
    source.set_encoding("jpeg:q=80").await?;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(40));
        let mut tick = 0u32;
        loop {
            ticker.tick().await;
            if let Err(e) = source.send_frame(&pattern(props, tick)).await {
                tracing::error!(error = %e, "publish failed");
                break;
            }
            tick = tick.wrapping_add(1);
        }
    });

    // subscriber: pull the same pattern back as raw frames
    let subscriber = Connection::connect(addr).await?;
    let mut stream = StreamHandle::open(&subscriber, "pattern", "raw").await?;

    let mut frames = 0u64;
    let mut bytes = 0u64;
    let mut last_report = tokio::time::Instant::now();
    loop {
        let frame = stream.recv_frame().await?;
        frames += 1;
        bytes += frame.len() as u64;

        if last_report.elapsed() >= Duration::from_secs(1) {
            println!("received {} frames, {} KiB", frames, bytes / 1024);
            last_report = tokio::time::Instant::now();
        }
    }
}
