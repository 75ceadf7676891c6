//! Both proxy fronts driven over loopback sockets.

use bytes::BytesMut;
use sokcs::codec::RequestDecoder;
use sokcs::tokio_rustls::rustls;
use sokcs::tokio_rustls::{TlsAcceptor, TlsConnector};
use sokcs::{
  encode_basic_auth, Authority, IdentityCache, ProxyServer, Request, RootIdentity,
  StaticCredentials,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_socks(server: ProxyServer) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move { server.serve_socks(listener).await });
  addr
}

async fn spawn_http(server: Arc<ProxyServer>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move { server.serve_http(listener).await });
  addr
}

async fn echo_server() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let (mut r, mut w) = stream.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
      });
    }
  });
  addr
}

async fn closed_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap().port()
}

/// Read until the end of an HTTP head.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    let n = stream.read(&mut byte).await.unwrap();
    assert_ne!(n, 0, "peer closed inside a head: {:?}", String::from_utf8_lossy(&head));
    head.push(byte[0]);
  }
  String::from_utf8(head).unwrap()
}

/// Read one aggregated request the way the proxy would.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Request {
  let mut decoder = RequestDecoder::new(1024 * 1024);
  let mut buf = BytesMut::new();
  loop {
    if let Some(request) = decoder.decode(&mut buf).unwrap() {
      return request;
    }
    let n = stream.read_buf(&mut buf).await.unwrap();
    assert_ne!(n, 0, "peer closed before a full request");
  }
}

#[tokio::test]
async fn socks5_connect_relays_bytes() {
  let target = echo_server().await;
  let proxy = spawn_socks(ProxyServer::builder().build().unwrap()).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(&[5, 1, 0]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [5, 0]);

  let mut command = vec![5, 1, 0, 1, 127, 0, 0, 1];
  command.extend_from_slice(&target.port().to_be_bytes());
  client.write_all(&command).await.unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..2], &[5, 0]);
  assert_eq!(&reply[3..], &command[3..]);

  client.write_all(b"ping").await.unwrap();
  let mut echoed = [0u8; 4];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn socks5_wrong_password_is_refused_and_closed() {
  let proxy = spawn_socks(
    ProxyServer::builder()
      .authenticator(StaticCredentials::new("aa", "aa"))
      .build()
      .unwrap(),
  )
  .await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(&[5, 1, 0]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [5, 2], "password mode is advertised");

  client.write_all(&[1, 2, b'b', b'b', 2, b'b', b'b']).await.unwrap();
  let mut status = [0u8; 2];
  client.read_exact(&mut status).await.unwrap();
  assert_eq!(status, [1, 1]);

  let mut rest = Vec::new();
  client.read_to_end(&mut rest).await.unwrap();
  assert!(rest.is_empty(), "connection closes after a failed exchange");
}

#[tokio::test]
async fn socks5_connect_is_refused_before_password() {
  let target = echo_server().await;
  let proxy = spawn_socks(
    ProxyServer::builder()
      .authenticator(StaticCredentials::new("aa", "aa"))
      .build()
      .unwrap(),
  )
  .await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(&[5, 1, 2]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  let mut command = vec![5, 1, 0, 1, 127, 0, 0, 1];
  command.extend_from_slice(&target.port().to_be_bytes());
  client.write_all(&command).await.unwrap();

  let mut rest = Vec::new();
  let _ = client.read_to_end(&mut rest).await;
  assert!(rest.is_empty());
}

#[tokio::test]
async fn socks5_password_then_connect() {
  let target = echo_server().await;
  let proxy = spawn_socks(
    ProxyServer::builder()
      .authenticator(StaticCredentials::new("aa", "aa"))
      .build()
      .unwrap(),
  )
  .await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(&[5, 1, 2]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  client.write_all(&[1, 2, b'a', b'a', 2, b'a', b'a']).await.unwrap();
  let mut status = [0u8; 2];
  client.read_exact(&mut status).await.unwrap();
  assert_eq!(status, [1, 0]);

  let mut command = vec![5, 1, 0, 3, 9];
  command.extend_from_slice(b"localhost");
  command.extend_from_slice(&target.port().to_be_bytes());
  client.write_all(&command).await.unwrap();
  let mut reply = vec![0u8; command.len()];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply[1], 0);

  client.write_all(b"hello").await.unwrap();
  let mut echoed = [0u8; 5];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"hello");
}

#[tokio::test]
async fn socks4a_connect_by_name() {
  let target = echo_server().await;
  let proxy = spawn_socks(ProxyServer::builder().build().unwrap()).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let mut request = vec![4, 1];
  request.extend_from_slice(&target.port().to_be_bytes());
  request.extend_from_slice(&[0, 0, 0, 1]);
  request.extend_from_slice(b"me\0localhost\0");
  client.write_all(&request).await.unwrap();
  let mut reply = [0u8; 8];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply[..2], [0, 0x5a]);

  client.write_all(b"v4").await.unwrap();
  let mut echoed = [0u8; 2];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"v4");
}

#[tokio::test]
async fn socks5_unreachable_target_gets_failure_reply() {
  let port = closed_port().await;
  let proxy = spawn_socks(ProxyServer::builder().build().unwrap()).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(&[5, 1, 0]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  let mut command = vec![5, 1, 0, 1, 127, 0, 0, 1];
  command.extend_from_slice(&port.to_be_bytes());
  client.write_all(&command).await.unwrap();

  let mut rest = Vec::new();
  client.read_to_end(&mut rest).await.unwrap();
  assert_eq!(rest[..2], [5, 1]);
}

#[tokio::test]
async fn http_missing_credentials_get_407_and_may_retry() {
  let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = target.local_addr().unwrap().port();
  let proxy = spawn_http(Arc::new(
    ProxyServer::builder()
      .authenticator(StaticCredentials::new("aa", "aa"))
      .build()
      .unwrap(),
  ))
  .await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let plain = format!(
    "GET http://localhost:{port}/first HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n"
  );
  client.write_all(plain.as_bytes()).await.unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
  assert!(head.contains("proxy-authenticate: Basic realm=\"sokcs\""), "{}", head);
  assert!(head.contains("connection: keep-alive"), "{}", head);

  let authorized = format!(
    "GET http://localhost:{port}/second HTTP/1.1\r\nHost: localhost:{port}\r\nProxy-Authorization: {}\r\n\r\n",
    encode_basic_auth("aa", "aa")
  );
  client.write_all(authorized.as_bytes()).await.unwrap();
  let (mut upstream, _) = target.accept().await.unwrap();
  let request = read_request(&mut upstream).await;
  assert_eq!(request.uri().path(), "/second");
}

#[tokio::test]
async fn plain_http_request_reaches_target_unchanged() {
  let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = target.local_addr().unwrap().port();
  let proxy = spawn_http(Arc::new(ProxyServer::builder().build().unwrap())).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let raw = format!(
    "POST /path?q=1 HTTP/1.1\r\nHost: localhost:{port}\r\nX-Trace: abc\r\nContent-Length: 4\r\n\r\nbody"
  );
  client.write_all(raw.as_bytes()).await.unwrap();

  let (mut upstream, _) = target.accept().await.unwrap();
  let forwarded = read_request(&mut upstream).await;
  let mut original_buf = BytesMut::from(raw.as_bytes());
  let original = RequestDecoder::new(1024)
    .decode(&mut original_buf)
    .unwrap()
    .unwrap();
  assert_eq!(forwarded, original);

  upstream
    .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert_eq!(head, "HTTP/1.1 204 No Content\r\n\r\n");
}

#[tokio::test]
async fn connect_without_inspection_is_an_opaque_tunnel() {
  let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = target.local_addr().unwrap().port();
  let proxy = spawn_http(Arc::new(ProxyServer::builder().build().unwrap())).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client
    .write_all(format!("CONNECT localhost:{port} HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert_eq!(head, "HTTP/1.1 200 OK\r\n\r\n");

  let (mut upstream, _) = target.accept().await.unwrap();
  client.write_all(b"\x16\x03\x01 not really tls").await.unwrap();
  let mut got = [0u8; 18];
  upstream.read_exact(&mut got).await.unwrap();
  assert_eq!(&got, b"\x16\x03\x01 not really tls");

  upstream.write_all(b"back").await.unwrap();
  let mut back = [0u8; 4];
  client.read_exact(&mut back).await.unwrap();
  assert_eq!(&back, b"back");
}

#[tokio::test]
async fn connect_failure_writes_nothing() {
  let root = RootIdentity::generate_default().unwrap();
  let tunnel = Arc::new(ProxyServer::builder().build().unwrap());
  let intercepting = Arc::new(
    ProxyServer::builder()
      .inspector(|_: &Request| {})
      .authority(Authority::new(root))
      .build()
      .unwrap(),
  );
  for server in [tunnel, intercepting] {
    let port = closed_port().await;
    let proxy = spawn_http(server).await;
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
      .write_all(format!("CONNECT localhost:{port} HTTP/1.1\r\n\r\n").as_bytes())
      .await
      .unwrap();
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    assert!(rest.is_empty(), "got {:?}", String::from_utf8_lossy(&rest));
  }
}

fn ring() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// TLS server answering every request with `ok`, presenting a leaf from an
/// unrelated root.
async fn tls_target() -> SocketAddr {
  let authority = Authority::new(RootIdentity::generate_default().unwrap());
  let leaf = IdentityCache::new(Arc::new(authority))
    .get_or_create("localhost", 0)
    .unwrap();
  let config = rustls::ServerConfig::builder_with_provider(ring())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![leaf.cert_der().clone()], leaf.key().private_key_der())
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let mut tls = acceptor.accept(stream).await.unwrap();
        let _ = read_request(&mut tls).await;
        tls
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
          .await
          .unwrap();
        tls.flush().await.unwrap();
      });
    }
  });
  addr
}

#[tokio::test]
async fn connect_with_inspection_decrypts_and_inspects() {
  let target = tls_target().await;
  let port = target.port();

  let root = RootIdentity::generate_default().unwrap();
  let mut roots = rustls::RootCertStore::empty();
  roots.add(root.cert_der().clone()).unwrap();

  let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let sink = seen.clone();
  let server = Arc::new(
    ProxyServer::builder()
      .inspector(move |request: &Request| sink.lock().push(request.uri().path().to_string()))
      .authority(Authority::new(root))
      .build()
      .unwrap(),
  );
  let cache = server.identity_cache().unwrap().clone();
  assert!(cache.is_empty());
  let proxy = spawn_http(server).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client
    .write_all(format!("CONNECT localhost:{port} HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert_eq!(head, "HTTP/1.1 200 OK\r\n\r\n");
  assert_eq!(cache.len(), 1);
  assert!(cache.get("localhost", port).is_some());

  let config = rustls::ClientConfig::builder_with_provider(ring())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
  let mut tls = connector
    .connect(name, client)
    .await
    .expect("forged leaf is trusted through the proxy root");

  tls
    .write_all(format!("GET /secret HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let head = read_head(&mut tls).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
  let mut body = [0u8; 2];
  tls.read_exact(&mut body).await.unwrap();
  assert_eq!(&body, b"ok");
  assert_eq!(seen.lock().as_slice(), ["/secret".to_string()]);
  assert_eq!(cache.len(), 1);
}
