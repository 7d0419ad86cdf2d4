use warp::Filter;

/// Builds the `/healthz` liveness route. Always returns 200 once the process
/// is up and serving; there is no readiness distinction to make since the
/// signaling server has no external dependency to wait on at startup.
pub fn healthz_route() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("healthz").and(warp::get()).map(|| "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let filter = healthz_route();
        let res = warp::test::request().path("/healthz").reply(&filter).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.body(), "ok");
    }
}
