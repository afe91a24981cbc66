//! Bidirectional byte relay between a client and its upstream.
use crate::errors::Result;
use crate::throttle::GlobalTrafficShaper;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Parameters of one relay.
#[derive(Clone)]
pub(crate) struct RelaySettings {
  pub(crate) chunk_size: usize,
  pub(crate) idle_timeout: Duration,
  pub(crate) shaper: Option<Arc<GlobalTrafficShaper>>,
}

#[derive(Clone, Copy)]
enum Direction {
  ToServer,
  ToClient,
}

/// Copy bytes both ways until both sides are done.
///
/// A side is done at EOF or once it stays idle for the idle timeout. EOF on one side is passed
/// on as a write shutdown, and the other direction keeps flowing, so a client that half-closes
/// after its request still gets the response. An error in either direction ends the relay.
///
/// Returns the bytes sent to the server and to the client.
pub(crate) async fn relay<C, U>(client: C, upstream: U, settings: RelaySettings) -> Result<(u64, u64)>
where
  C: AsyncRead + AsyncWrite + Unpin,
  U: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
  let mut sent = 0u64;
  let mut received = 0u64;
  {
    let client_to_server = pump(
      &mut client_read,
      &mut upstream_write,
      &settings,
      Direction::ToServer,
      &mut sent,
    );
    let server_to_client = pump(
      &mut upstream_read,
      &mut client_write,
      &settings,
      Direction::ToClient,
      &mut received,
    );
    tokio::pin!(client_to_server, server_to_client);
    let mut to_server_done = false;
    let mut to_client_done = false;
    while !(to_server_done && to_client_done) {
      tokio::select! {
        r = &mut client_to_server, if !to_server_done => {
          r?;
          to_server_done = true;
        }
        r = &mut server_to_client, if !to_client_done => {
          r?;
          to_client_done = true;
        }
      }
    }
  }
  Ok((sent, received))
}

async fn pump<R, W>(
  reader: &mut R,
  writer: &mut W,
  settings: &RelaySettings,
  direction: Direction,
  total: &mut u64,
) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; settings.chunk_size];
  loop {
    let n = if settings.idle_timeout.is_zero() {
      reader.read(&mut buffer).await?
    } else {
      match tokio::time::timeout(settings.idle_timeout, reader.read(&mut buffer)).await {
        Ok(read) => read?,
        Err(_) => {
          tracing::debug!("relay idle for {:?}, closing", settings.idle_timeout);
          break;
        }
      }
    };
    if n == 0 {
      break;
    }
    if let Some(shaper) = &settings.shaper {
      match direction {
        Direction::ToServer => shaper.throttle_write(n).await,
        Direction::ToClient => shaper.throttle_read(n).await,
      }
    }
    writer.write_all(&buffer[..n]).await?;
    writer.flush().await?;
    *total += n as u64;
  }
  let _ = writer.shutdown().await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn relays_both_ways() {
    let (client, mut client_peer) = tokio::io::duplex(64);
    let (upstream, mut upstream_peer) = tokio::io::duplex(64);
    let settings = RelaySettings {
      chunk_size: 16,
      idle_timeout: Duration::from_secs(5),
      shaper: None,
    };
    let task = tokio::spawn(relay(client, upstream, settings));

    client_peer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    upstream_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    upstream_peer.write_all(b"pong").await.unwrap();
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    drop(upstream_peer);
    drop(client_peer);
    let (sent, received) = task.await.unwrap().unwrap();
    assert_eq!((sent, received), (4, 4));
  }

  #[tokio::test]
  async fn half_closed_client_still_gets_response() {
    let (client, mut client_peer) = tokio::io::duplex(64);
    let (upstream, mut upstream_peer) = tokio::io::duplex(64);
    let settings = RelaySettings {
      chunk_size: 16,
      idle_timeout: Duration::from_secs(5),
      shaper: None,
    };
    let task = tokio::spawn(relay(client, upstream, settings));

    client_peer.write_all(b"request").await.unwrap();
    client_peer.shutdown().await.unwrap();

    // the server sees the whole request followed by EOF, then answers
    let mut request = Vec::new();
    upstream_peer.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"request");
    upstream_peer.write_all(b"response").await.unwrap();
    drop(upstream_peer);

    let mut response = Vec::new();
    client_peer.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"response");
    let (sent, received) = task.await.unwrap().unwrap();
    assert_eq!((sent, received), (7, 8));
  }

  #[tokio::test]
  async fn idle_relay_ends() {
    let (client, _client_peer) = tokio::io::duplex(64);
    let (upstream, _upstream_peer) = tokio::io::duplex(64);
    let settings = RelaySettings {
      chunk_size: 16,
      idle_timeout: Duration::from_millis(50),
      shaper: None,
    };
    let result = tokio::time::timeout(Duration::from_secs(5), relay(client, upstream, settings)).await;
    assert!(matches!(result, Ok(Ok((0, 0)))));
  }
}
