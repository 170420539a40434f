use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use xmpp_stream::connect::{BoxedStream, ServerConnector};
use xmpp_stream::jid::Jid;
use xmpp_stream::{Client, ClientConfig, Error, Event, ReconnectPolicy};

/// Accepts every write, never has anything to read, and cannot flush.
#[derive(Debug)]
struct UnflushableStream;

impl AsyncRead for UnflushableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for UnflushableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug, Clone)]
struct UnflushableConnector;

impl ServerConnector for UnflushableConnector {
    async fn connect(&self, _jid: &Jid) -> Result<BoxedStream, Error> {
        Ok(Box::new(UnflushableStream))
    }
}

#[tokio::test]
async fn flush_failure_schedules_reconnection() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jid: Jid = "user@example.com".parse().unwrap();
    let policy = ReconnectPolicy {
        schedule: Vec::new(),
        max_delay: Duration::from_millis(50),
        keep_alive_delay: Duration::from_millis(50),
    };
    let mut client =
        Client::new_with_connector(ClientConfig::new(jid, "pencil"), UnflushableConnector, policy);

    let events = async {
        let mut seen = Vec::new();
        while let Some(event) = client.next().await {
            let now = matches!(event, Event::ReconnectingNow);
            seen.push(event);
            if now {
                break;
            }
        }
        seen
    };
    let seen = tokio::time::timeout(Duration::from_secs(3), events)
        .await
        .expect("no reconnection after a flush failure");
    assert!(matches!(seen[0], Event::Disconnected(_)));
    match seen[1] {
        Event::Reconnecting { delay } => assert_eq!(delay, Duration::from_millis(50)),
        ref other => panic!("unexpected client event {:?}", other),
    }
    assert!(matches!(seen.last(), Some(Event::ReconnectingNow)));
}
