//! Dialing through HTTP CONNECT and SOCKS5 proxies.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tether::{Dialer, DialerHandle, LoadBalancer, ProxyConfigurator, ProxyEnvironment};

mod common;

fn env_for(proxy: &str) -> ProxyEnvironment {
    ProxyEnvironment {
        https_proxy: proxy.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn dials_through_http_connect_proxy() {
    let backend = common::start_echo_backend().await.to_string();
    let (proxy, requests) = common::start_connect_proxy(200).await;

    let handle = Arc::new(DialerHandle::new());
    // Loopback targets are never proxied, so resolve against a remote-looking URL.
    ProxyConfigurator::new(Arc::clone(&handle))
        .configure_with("https://10.0.0.1:6443", true, &env_for(&format!("http://{proxy}")))
        .unwrap();
    assert!(matches!(*handle.load(), Dialer::HttpConnect(_)));

    let lb = LoadBalancer::new("supervisor", backend.clone(), handle);
    let mut conn = lb.dial("tcp", &backend).await.unwrap();
    assert_eq!(common::echo_roundtrip(&mut conn, b"tunnel").await, b"tunnel");
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(lb.connection_count(&backend), 1);
}

#[tokio::test]
async fn refused_connect_surfaces_error_and_tracks_nothing() {
    let backend = common::start_echo_backend().await.to_string();
    let (proxy, requests) = common::start_connect_proxy(403).await;

    let handle = Arc::new(DialerHandle::with_dialer(
        Dialer::from_proxy_url(&format!("http://{proxy}").parse().unwrap()).unwrap(),
    ));
    let lb = LoadBalancer::new("supervisor", backend.clone(), handle);

    let err = lb.dial("tcp", &backend).await.unwrap_err();
    assert!(err.to_string().contains("403"));
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(lb.connection_count(&backend), 0);
}

#[tokio::test]
async fn dials_through_socks5_proxy() {
    let backend = common::start_echo_backend().await.to_string();
    let (proxy, requests) = common::start_socks5_proxy().await;

    let handle = Arc::new(DialerHandle::new());
    ProxyConfigurator::new(Arc::clone(&handle))
        .configure_with("https://10.0.0.1:6443", true, &env_for(&format!("socks5://{proxy}")))
        .unwrap();
    assert!(matches!(*handle.load(), Dialer::Socks5(_)));

    let lb = LoadBalancer::new("supervisor", backend.clone(), handle);
    let mut conn = lb.dial("tcp", &backend).await.unwrap();
    assert_eq!(common::echo_roundtrip(&mut conn, b"socks").await, b"socks");
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn replacing_the_dialer_affects_later_dials_only() {
    let backend = common::start_echo_backend().await.to_string();
    let (proxy, requests) = common::start_connect_proxy(200).await;

    let handle = Arc::new(DialerHandle::new());
    let lb = LoadBalancer::new("supervisor", backend.clone(), Arc::clone(&handle));

    let mut direct = lb.dial("tcp", &backend).await.unwrap();
    handle.store(Dialer::from_proxy_url(&format!("http://{proxy}").parse().unwrap()).unwrap());
    let mut proxied = lb.dial("tcp", &backend).await.unwrap();

    assert_eq!(common::echo_roundtrip(&mut direct, b"a").await, b"a");
    assert_eq!(common::echo_roundtrip(&mut proxied, b"b").await, b"b");
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(lb.connection_count(&backend), 2);
}
