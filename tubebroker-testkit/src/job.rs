use std::future::Future;
use std::time::Duration;

/// PHP-serialized body routed to `domain`.
pub fn job_body(domain: &str) -> Vec<u8> {
    job_body_with(domain, &[])
}

/// PHP-serialized body routed to `domain` with extra string entries.
pub fn job_body_with(domain: &str, extra: &[(&str, &str)]) -> Vec<u8> {
    let mut body = format!("a:{}:{{", extra.len() + 1);
    for (key, value) in extra {
        body.push_str(&php_string(key));
        body.push_str(&php_string(value));
    }
    body.push_str(&php_string("domain"));
    body.push_str(&php_string(domain));
    body.push('}');
    body.into_bytes()
}

fn php_string(value: &str) -> String {
    format!("s:{}:\"{}\";", value.len(), value)
}

/// Poll `check` until it holds or `timeout` runs out.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let give_up = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= give_up {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
