use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, StatusCode};
use orderline::network::{ConnectivityMonitor, ConnectivityState, HttpProbe};
use tokio_util::sync::CancellationToken;

/// Health endpoint that answers 200 while `healthy` is set and 503 otherwise.
fn start_health_server(healthy: Arc<AtomicBool>) -> SocketAddr {
    let make_svc = make_service_fn(move |_conn| {
        let healthy = Arc::clone(&healthy);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: hyper::Request<Body>| {
                let healthy = Arc::clone(&healthy);
                async move {
                    let status = if req.uri().path() != "/api/health" {
                        StatusCode::NOT_FOUND
                    } else if healthy.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    let mut resp = Response::new(Body::from("{}"));
                    *resp.status_mut() = status;
                    Ok::<_, Infallible>(resp)
                }
            }))
        }
    });

    let server = hyper::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    addr
}

#[tokio::test]
async fn connectivity_check_once_returns_true_for_healthy_server() {
    let addr = start_health_server(Arc::new(AtomicBool::new(true)));

    let probe = HttpProbe::new(&format!("http://{addr}/api"), Duration::from_secs(1)).unwrap();
    assert!(
        probe.check_once().await,
        "expected HttpProbe to report healthy server"
    );
}

#[tokio::test]
async fn connectivity_check_once_returns_false_for_unreachable_target() {
    // Grab a free port, then close it so nothing is listening there.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let probe = HttpProbe::new(
        &format!("http://127.0.0.1:{port}/api"),
        Duration::from_millis(500),
    )
    .unwrap();
    assert!(
        !probe.check_once().await,
        "expected HttpProbe to report unreachable target as false"
    );
}

#[tokio::test]
async fn run_loop_commits_transitions_after_consecutive_readings() {
    let healthy = Arc::new(AtomicBool::new(true));
    let addr = start_health_server(Arc::clone(&healthy));
    let probe = Arc::new(
        HttpProbe::new(&format!("http://{addr}/api"), Duration::from_millis(500)).unwrap(),
    );

    let monitor = Arc::new(ConnectivityMonitor::new(false, 2));
    let mut rx = monitor.subscribe();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&monitor).run(
        probe,
        Duration::from_millis(10),
        shutdown.clone(),
    ));

    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|online| *online))
        .await
        .expect("should come online")
        .unwrap();
    assert_eq!(monitor.state(), ConnectivityState::Online);

    healthy.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|online| !*online))
        .await
        .expect("should go offline")
        .unwrap();
    assert_eq!(monitor.state(), ConnectivityState::Offline);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("run loop stops on shutdown")
        .unwrap();
}
