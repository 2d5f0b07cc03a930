mod common;

use std::sync::Arc;

use http::StatusCode;
use tokio::io::AsyncWriteExt;

use common::Client;
use wirehttp::{handler_fn, Dispatcher, HandlerError};

fn precedence_dispatcher() -> Arc<Dispatcher> {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.add_exact("/foo", common::text("exact"));
    dispatcher.add_prefix("/fo", common::text("prefix"));
    dispatcher.add_content_type("text/xml", common::text("xml-rpc"));
    dispatcher
}

#[tokio::test]
async fn first_matching_table_wins() {
    let server = common::start(precedence_dispatcher()).await;
    let mut client = Client::connect(server.addr).await;

    client
        .send("POST /foo HTTP/1.1\r\nHost: t\r\nContent-Type: text/xml\r\nContent-Length: 2\r\n\r\n<a")
        .await;
    assert_eq!(client.response().await.text(), "exact");

    client.send("GET /fox?q=1 HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(client.response().await.text(), "prefix");

    client
        .send("POST / HTTP/1.1\r\nHost: t\r\nContent-Type: Text/XML; charset=utf-8\r\nContent-Length: 2\r\n\r\n<a")
        .await;
    assert_eq!(client.response().await.text(), "xml-rpc");

    client.send("GET /bar HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let res = client.response().await;
    assert_eq!(res.status, 404);
    assert_eq!(res.text(), "Not Found");
    assert_eq!(res.header("content-type"), Some("text/plain; charset=utf-8"));
}

#[tokio::test]
async fn asterisk_target_gets_empty_response() {
    let server = common::start(precedence_dispatcher()).await;
    let mut client = Client::connect(server.addr).await;
    client.send("OPTIONS * HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let res = client.response().await;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("content-length"), Some("0"));
}

#[tokio::test]
async fn handler_status_errors_become_responses() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.add_exact(
        "/teapot",
        handler_fn(|_req, _res| {
            Box::pin(async move { Err(HandlerError::status(StatusCode::IM_A_TEAPOT, "short and stout")) })
        }),
    );
    dispatcher.add_exact("/hello", common::text("hello"));
    let server = common::start(dispatcher).await;
    let mut client = Client::connect(server.addr).await;

    client.send("GET /teapot HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let res = client.response().await;
    assert_eq!(res.status, 418);
    assert_eq!(res.text(), "short and stout");

    // Still keep-alive.
    client.send("GET /hello HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(client.response().await.status, 200);
}

#[tokio::test]
async fn unexpected_handler_errors_drop_the_connection() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.add_exact(
        "/boom",
        handler_fn(|_req, _res| {
            Box::pin(async move {
                let err: Box<dyn std::error::Error + Send + Sync> = "database on fire".into();
                Err(HandlerError::Other(err))
            })
        }),
    );
    let server = common::start(dispatcher).await;
    let mut client = Client::connect(server.addr).await;
    client.send("GET /boom HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn unclosed_responses_are_finished_by_the_dispatcher() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.add_exact(
        "/silent",
        handler_fn(|_req, res| {
            Box::pin(async move {
                res.set_status(StatusCode::ACCEPTED)?;
                Ok(())
            })
        }),
    );
    let server = common::start(dispatcher).await;
    let mut client = Client::connect(server.addr).await;

    client.send("GET /silent HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let res = client.response().await;
    assert_eq!(res.status, 202);
    assert_eq!(res.header("content-length"), Some("0"));
}

#[tokio::test]
async fn detached_handlers_own_the_socket() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.add_exact(
        "/raw",
        handler_fn(|_req, res| {
            Box::pin(async move {
                let mut io = res.detach().await?;
                io.write_all(b"raw bytes").await?;
                io.shutdown().await?;
                Ok(())
            })
        }),
    );
    let server = common::start(dispatcher).await;
    let mut client = Client::connect(server.addr).await;
    client.send("GET /raw HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(client.read_exact(9).await, b"raw bytes");
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn handlers_can_be_registered_while_serving() {
    let dispatcher = Arc::new(Dispatcher::new());
    let server = common::start(Arc::clone(&dispatcher)).await;
    let mut client = Client::connect(server.addr).await;

    client.send("GET /late HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(client.response().await.status, 404);

    dispatcher.add_exact("/late", common::text("here now"));
    client.send("GET /late HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(client.response().await.text(), "here now");

    assert!(dispatcher.remove_exact("/late"));
    client.send("GET /late HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(client.response().await.status, 404);
}

#[tokio::test]
async fn post_without_body_is_rejected() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.add_exact("/submit", common::echo());
    let server = common::start(dispatcher).await;
    let mut client = Client::connect(server.addr).await;

    client.send("POST /submit HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let res = client.response().await;
    assert_eq!(res.status, 400);
    assert_eq!(res.header("connection"), Some("close"));
    assert!(client.is_closed().await);
}
