use super::candidate::{Candidate, COMPONENT_RTCP, COMPONENT_RTP};
use super::pair::IceRole;
use super::tester::{IceCredentials, IceOutcome, IceSessionTester};
use crate::Result;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Reserves a pair of free loopback ports by binding and dropping; the
/// tester binds them again right away.
async fn free_ports() -> Result<(u16, u16)> {
    let a = UdpSocket::bind("127.0.0.1:0").await?;
    let b = UdpSocket::bind("127.0.0.1:0").await?;
    Ok((a.local_addr()?.port(), b.local_addr()?.port()))
}

fn host_pair(foundation: &str, rtp_port: u16, rtcp_port: u16) -> Vec<Candidate> {
    let rtp: SocketAddr = format!("127.0.0.1:{}", rtp_port).parse().unwrap();
    let rtcp: SocketAddr = format!("127.0.0.1:{}", rtcp_port).parse().unwrap();
    vec![
        Candidate::host(foundation.to_string(), COMPONENT_RTP, rtp, 65535),
        Candidate::host(foundation.to_string(), COMPONENT_RTCP, rtcp, 65535),
    ]
}

fn credentials(local: (&str, &str), remote: (&str, &str)) -> IceCredentials {
    IceCredentials {
        local_ufrag: local.0.to_string(),
        local_pwd: local.1.to_string(),
        remote_ufrag: remote.0.to_string(),
        remote_pwd: remote.1.to_string(),
    }
}

/// Scenario: one host pair per component on both sides, everything on
/// loopback. Both agents finish with a nominated pair per component and
/// agree on the endpoints.
#[tokio::test]
async fn test_host_pairs_nominate_per_component() -> Result<()> {
    let (a_rtp, a_rtcp) = free_ports().await?;
    let (b_rtp, b_rtcp) = free_ports().await?;

    let a_candidates = host_pair("1", a_rtp, a_rtcp);
    let b_candidates = host_pair("1", b_rtp, b_rtcp);

    let a_credentials = credentials(("ufA", "passwordA0000000000000"), ("ufB", "passwordB0000000000000"));
    let b_credentials = credentials(("ufB", "passwordB0000000000000"), ("ufA", "passwordA0000000000000"));

    let controller = IceSessionTester::new(
        IceRole::Controller,
        a_credentials,
        CancellationToken::new(),
    );
    let controllee = IceSessionTester::new(
        IceRole::Controllee,
        b_credentials,
        CancellationToken::new(),
    );

    let a_local = a_candidates.clone();
    let a_remote = b_candidates.clone();
    let controller_run = async move { controller.run(&a_local, &a_remote).await };
    let controllee_run = async move { controllee.run(&b_candidates, &a_candidates).await };

    let (a_outcome, b_outcome) = tokio::join!(controller_run, controllee_run);

    let a_selected = match a_outcome {
        IceOutcome::Success(selected) => selected,
        IceOutcome::Failure(reason) => panic!("controller failed: {}", reason),
    };
    assert_eq!(a_selected.len(), 2);
    assert!(a_selected.iter().all(|p| p.nominated));
    let rtp = a_selected
        .iter()
        .find(|p| p.component() == COMPONENT_RTP)
        .expect("RTP pair selected");
    assert_eq!(rtp.local.port, a_rtp);
    assert_eq!(rtp.remote.port, b_rtp);
    let rtcp = a_selected
        .iter()
        .find(|p| p.component() == COMPONENT_RTCP)
        .expect("RTCP pair selected");
    assert_eq!(rtcp.local.port, a_rtcp);
    assert_eq!(rtcp.remote.port, b_rtcp);

    match b_outcome {
        IceOutcome::Success(selected) => {
            assert_eq!(selected.len(), 2);
            assert!(selected.iter().all(|p| p.nominated));
        }
        IceOutcome::Failure(reason) => panic!("controllee failed: {}", reason),
    }
    Ok(())
}

/// An unreachable peer fails the session within the controller deadline.
#[tokio::test]
async fn test_unreachable_peer_fails() -> Result<()> {
    let (a_rtp, a_rtcp) = free_ports().await?;
    // nothing listens on the remote ports
    let remote = host_pair("1", 1, 2);
    let local = host_pair("1", a_rtp, a_rtcp);

    let credentials = credentials(("ufA", "passwordA0000000000000"), ("ufB", "passwordB0000000000000"));
    let tester = IceSessionTester::new(IceRole::Controller, credentials, CancellationToken::new());

    let outcome = tester.run(&local, &remote).await;
    assert!(matches!(outcome, IceOutcome::Failure(_)));
    Ok(())
}

/// Cancellation stops the run promptly.
#[tokio::test]
async fn test_cancel_stops_session() -> Result<()> {
    let (a_rtp, a_rtcp) = free_ports().await?;
    let local = host_pair("1", a_rtp, a_rtcp);
    let remote = host_pair("1", 1, 2);

    let cancel_token = CancellationToken::new();
    let credentials = credentials(("ufA", "passwordA0000000000000"), ("ufB", "passwordB0000000000000"));
    let tester = IceSessionTester::new(IceRole::Controller, credentials, cancel_token.clone());

    let run = tokio::spawn(async move { tester.run(&local, &remote).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel_token.cancel();
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), run)
        .await
        .expect("run ends after cancel")
        .expect("task joins");
    assert!(matches!(outcome, IceOutcome::Failure(_)));
    Ok(())
}
