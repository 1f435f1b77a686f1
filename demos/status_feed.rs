use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::net::TcpListener;
use wireline::{
    limits::ServerLimits, Context, HandlerError, HandlerRegistry, Method, Server, StatusCode,
};

#[derive(Default)]
struct Feed {
    events: AtomicUsize,
    rejected: AtomicUsize,
}

impl Feed {
    fn status(&self, ctx: &mut Context) -> Result<(), HandlerError> {
        let body = format!(
            r#"{{"events": {}, "rejected": {}, "peer": {:?}}}"#,
            self.events.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            ctx.peer_addr().map(|addr| addr.to_string()).unwrap_or_default(),
        );

        let compress = ctx.request().query().contains("deflate");
        ctx.response_mut()
            .content_type(mime::APPLICATION_JSON)
            .cache_seconds(0)
            .compress(compress)
            .body(body);
        Ok(())
    }

    fn hook(&self, ctx: &mut Context) -> Result<(), HandlerError> {
        if ctx.request().method() != Method::Post {
            ctx.response_mut().status(StatusCode::MethodNotAllowed);
            return Ok(());
        }

        if ctx.request().header("X-Signature").is_none() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            ctx.response_mut().status(StatusCode::Unauthorized);
            return Ok(());
        }

        let count = self.events.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(count, bytes = ctx.request().raw_length(), event = ctx.request().text(), "webhook received");

        ctx.response_mut()
            .status(StatusCode::Accepted)
            .content_type(mime::TEXT_PLAIN)
            .body(format!("event #{count} accepted"));
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let feed = Arc::new(Feed::default());
    let registry = Arc::new(HandlerRegistry::new());

    let status = feed.clone();
    registry.register("/status", move |ctx: &mut Context| status.status(ctx));

    let hook = feed.clone();
    registry.register("/hook", move |ctx: &mut Context| hook.hook(ctx));

    registry.register("/report.csv", |ctx: &mut Context| -> Result<(), HandlerError> {
        ctx.response_mut()
            .content_type(mime::TEXT_CSV)
            .file_name("report.csv")
            .body("day,events\nmon,12\ntue,7\n");
        Ok(())
    });

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .registry(registry)
        .server_limits(ServerLimits {
            verbose: true,
            ..ServerLimits::default()
        })
        .build()
        .launch_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
}
