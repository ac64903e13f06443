use std::time::Duration;

const USER_AGENT: &str = concat!("skyposter/", env!("CARGO_PKG_VERSION"));

/// Every collaborator shares this builder so proxy handling and the user agent
/// stay consistent. System proxy discovery is opt-in because it can hang on
/// misconfigured hosts.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> reqwest::Client {
    let allow_system_proxy = std::env::var("SKYPOSTER_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return client,
            Err(e) => tracing::warn!(
                "HTTP client initialization with system proxy failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    match attempt_build(timeout, true) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("HTTP client builder failed ({}); using reqwest defaults", e);
            reqwest::Client::new()
        }
    }
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
