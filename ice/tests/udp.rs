use std::net::IpAddr;
use std::time::Duration;

use xmpp_ice::{IceConfig, IceConnection, IceEvent, UdpIceDriver};

fn driver(controlling: bool) -> UdpIceDriver {
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();
    let connection = IceConnection::new(IceConfig {
        controlling,
        ..IceConfig::default()
    });
    UdpIceDriver::bind(connection, &[localhost]).unwrap()
}

/// Signal `from`'s credentials and candidates to `to`.
fn signal(from: &UdpIceDriver, to: &mut UdpIceDriver) {
    let from = from.connection();
    let to = to.connection_mut();
    to.set_remote_user(from.local_user());
    to.set_remote_password(from.local_password());
    for candidate in from.local_candidates() {
        assert!(to.add_remote_candidate(candidate).unwrap());
    }
}

async fn run(driver: &mut UdpIceDriver, initiator: bool) -> Vec<u8> {
    loop {
        match driver.next_event().await.unwrap() {
            IceEvent::Connected if initiator => driver.send_datagram(1, b"ping").await.unwrap(),
            IceEvent::DatagramReceived { component, data } => {
                if !initiator {
                    driver.send_datagram(component, b"pong").await.unwrap();
                }
                return data;
            }
            IceEvent::Disconnected => panic!("ICE failed"),
            _ => (),
        }
    }
}

#[tokio::test]
async fn loopback_ping_pong() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut initiator = driver(true);
    let mut responder = driver(false);
    signal(&responder, &mut initiator);
    signal(&initiator, &mut responder);

    initiator.connect_to_host().await;
    responder.connect_to_host().await;

    let (pong, ping) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(run(&mut initiator, true), run(&mut responder, false))
    })
    .await
    .unwrap();
    assert_eq!(ping, b"ping");
    assert_eq!(pong, b"pong");
    assert!(initiator.connection().is_connected());
}
