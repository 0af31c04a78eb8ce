//! Azure Storage REST client with SharedKey signing / Azure存储REST客户端
//!
//! Shared by the Blob and File drivers. Requests are built as
//! [`AzureRequest`] and go through the [`AzureClient`] seam;
//! [`AzureRestClient`] signs them with the account key and sends them
//! through one reqwest client per driver.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use sha2::Sha256;
use tokio_util::io::StreamReader;

use crate::credentials::Credential;
use crate::error::{Result, StorageError};
use crate::storage::ObjectReader;

type HmacSha256 = Hmac<Sha256>;

/// Service version sent with every request (seal needs 2019-12-12+) / API版本
pub const API_VERSION: &str = "2021-12-02";

/// Headers that take a fixed slot in the string to sign, in order / 签名标准头
const STANDARD_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// One REST call before signing / 待签名请求
#[derive(Debug, Clone)]
pub struct AzureRequest {
    pub method: Method,
    /// Decoded resource path below the account, e.g. `container/dir/a.txt`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl AzureRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_lowercase(), value.into()));
        self
    }

    /// Add `x-ms-meta-*` headers / 添加元数据头
    pub fn metadata<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, String)>) -> Self {
        for (name, value) in pairs {
            self.headers.push((format!("x-ms-meta-{}", name), value));
        }
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Percent-encode every path segment, keeping the slashes / 编码路径
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| urlencoding::encode(segment).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// RFC 1123 date as used by `x-ms-date` / HTTP日期
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an RFC 1123 or RFC 3339 timestamp from a response / 解析时间
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// SharedKey signer / SharedKey签名器
#[derive(Clone)]
pub struct SharedKeySigner {
    account: String,
    key: Vec<u8>,
}

impl SharedKeySigner {
    pub fn new(account: &str, key_base64: &str) -> Result<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|e| StorageError::Fatal(format!("invalid Azure account key: {}", e)))?;
        Ok(Self {
            account: account.to_string(),
            key,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Build the canonical string to sign / 构造待签名字符串
    ///
    /// `url_path` is the encoded path exactly as it appears on the wire.
    pub fn string_to_sign(&self, request: &AzureRequest, url_path: &str, content_length: usize) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(16);
        parts.push(request.method.as_str().to_string());

        for name in STANDARD_HEADERS {
            let value = match name {
                // 长度为0时必须为空字符串
                "content-length" => {
                    if content_length == 0 {
                        String::new()
                    } else {
                        content_length.to_string()
                    }
                }
                _ => request.header_value(name).unwrap_or("").to_string(),
            };
            parts.push(value);
        }

        let mut ms_headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(k, _)| k.starts_with("x-ms-"))
            .map(|(k, v)| (k.clone(), v.trim().to_string()))
            .collect();
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut canonical = parts.join("\n");
        canonical.push('\n');
        for (k, v) in ms_headers {
            canonical.push_str(&format!("{}:{}\n", k, v));
        }

        canonical.push_str(&format!("/{}{}", self.account, url_path));

        let mut query: Vec<(String, String)> = request
            .query
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        query.sort();
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for (k, v) in query {
            match grouped.last_mut() {
                Some((last, values)) if *last == k => values.push(v),
                _ => grouped.push((k, vec![v])),
            }
        }
        for (k, values) in grouped {
            canonical.push_str(&format!("\n{}:{}", k, values.join(",")));
        }

        canonical
    }

    pub fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| StorageError::Fatal(format!("invalid account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    pub fn authorization(&self, string_to_sign: &str) -> Result<String> {
        Ok(format!("SharedKey {}:{}", self.account, self.sign(string_to_sign)?))
    }
}

/// Azure Storage operations used by the drivers / Azure请求接口
#[async_trait]
pub trait AzureClient: Send + Sync {
    /// Absolute URL of a resource, used for `x-ms-copy-source` / 资源URL
    fn resource_url(&self, path: &str) -> String;

    /// Send a request, returning the raw response / 发送请求
    async fn send(&self, request: AzureRequest) -> Result<Response>;

    /// Send and turn non-2xx responses into typed errors / 发送并检查状态
    async fn execute(&self, request: AzureRequest) -> Result<Response> {
        let context = format!("{} {}", request.method, request.path);
        let response = self.send(request).await?;
        check_response(response, &context).await
    }

    /// Execute, mapping 404 to `None` / 404返回None
    async fn execute_optional(&self, request: AzureRequest) -> Result<Option<Response>> {
        match self.execute(request).await {
            Ok(response) => Ok(Some(response)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// REST client for one storage service endpoint / 存储服务客户端
#[derive(Clone)]
pub struct AzureRestClient {
    client: Client,
    signer: SharedKeySigner,
    endpoint: String,
}

impl AzureRestClient {
    /// `service` is `blob` or `file`; `endpoint` overrides the public URL (Azurite etc.)
    pub fn new(credential: Option<Credential>, service: &str, endpoint: Option<&str>) -> Result<Self> {
        let (account, key) = match credential {
            Some(Credential::AzureSharedKey { account, key }) => (account, key),
            Some(other) => {
                return Err(StorageError::Fatal(format!(
                    "Azure {} driver needs an azure_shared_key credential, got {}",
                    service,
                    other.kind()
                )))
            }
            None => {
                return Err(StorageError::Fatal(format!(
                    "Azure {} driver is missing its credential",
                    service
                )))
            }
        };

        let signer = SharedKeySigner::new(&account, &key)?;
        let endpoint = match endpoint {
            Some(e) if !e.trim().is_empty() => e.trim_end_matches('/').to_string(),
            _ => format!("https://{}.{}.core.windows.net", account, service),
        };

        let client = Client::builder()
            .build()
            .map_err(|e| StorageError::Fatal(format!("创建HTTP客户端失败: {}", e)))?;

        Ok(Self {
            client,
            signer,
            endpoint,
        })
    }

    fn url_path(&self, path: &str) -> Result<String> {
        let url = url::Url::parse(&self.resource_url(path))
            .map_err(|e| StorageError::Fatal(format!("invalid Azure URL: {}", e)))?;
        Ok(url.path().to_string())
    }
}

#[async_trait]
impl AzureClient for AzureRestClient {
    fn resource_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, encode_path(path))
    }

    /// Sign and send a request / 签名并发送
    async fn send(&self, request: AzureRequest) -> Result<Response> {
        let now = http_date(Utc::now());
        let request = request
            .header("x-ms-date", now)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-client-request-id", uuid::Uuid::new_v4().to_string());

        let url_path = self.url_path(&request.path)?;
        let string_to_sign = self.signer.string_to_sign(&request, &url_path, request.body.len());
        let authorization = self.signer.authorization(&string_to_sign)?;

        let mut url = self.resource_url(&request.path);
        if !request.query.is_empty() {
            let query = request
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header("Authorization", authorization);
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if matches!(request.method, Method::PUT | Method::POST) {
            builder = builder.header("Content-Length", request.body.len().to_string());
        }

        tracing::debug!("Azure {} {}", request.method, url);
        let response = builder.body(request.body).send().await?;
        Ok(response)
    }
}

/// Map a non-success response to a `StorageError` / 检查响应状态
pub async fn check_response(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = if code.is_empty() {
        format!("{}: {}", context, body.trim())
    } else {
        format!("{}: {}", context, code)
    };
    Err(StorageError::from_status(status.as_u16(), detail))
}

/// Read a response header as string / 读取响应头
pub fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Collect `x-ms-meta-*` response headers / 收集元数据
pub fn metadata_from_headers(response: &Response) -> std::collections::BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            let name = k.as_str().strip_prefix("x-ms-meta-")?;
            Some((name.to_string(), v.to_str().ok()?.to_string()))
        })
        .collect()
}

/// Wrap a streaming body as AsyncRead / 响应体转为读取流
pub fn body_reader(response: Response) -> ObjectReader {
    let stream = response
        .bytes_stream()
        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    Box::new(StreamReader::new(stream))
}

/// Poll `check` until it reports true or the timeout elapses / 轮询直到满足条件
///
/// Returns whether the condition was observed. Errors from `check` propagate.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for an asynchronous server-side copy into `resource` to finish / 等待服务端复制完成
///
/// Blob and File copies report `x-ms-copy-status` on the destination.
pub async fn wait_for_copy(
    client: &dyn AzureClient,
    resource: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let done = poll_until(timeout, interval, move || async move {
        let response = match client
            .execute_optional(AzureRequest::new(Method::HEAD, resource))
            .await?
        {
            Some(r) => r,
            None => return Ok(false),
        };
        match header_str(&response, "x-ms-copy-status").as_deref() {
            Some("pending") => Ok(false),
            Some("failed") | Some("aborted") => Err(StorageError::Fatal(format!(
                "copy to {} failed: {}",
                resource,
                header_str(&response, "x-ms-copy-status-description").unwrap_or_default()
            ))),
            _ => Ok(true),
        }
    })
    .await?;
    if !done {
        return Err(StorageError::Transient(format!("copy to {} still pending", resource)));
    }
    Ok(())
}

/// Split a payload into provider-sized blocks / 按块大小切分
pub fn split_blocks(data: &Bytes, block_size: usize) -> Vec<Bytes> {
    if data.is_empty() {
        return Vec::new();
    }
    let block_size = block_size.max(1);
    (0..data.len())
        .step_by(block_size)
        .map(|start| data.slice(start..(start + block_size).min(data.len())))
        .collect()
}

/// Scripted in-memory Azure endpoint for driver tests / 模拟Azure服务
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use parking_lot::Mutex;

    type Responder = Box<dyn Fn(&AzureRequest) -> http::Response<Bytes> + Send + Sync>;

    /// Records every request and answers with `respond` / 记录请求并按脚本应答
    pub struct ScriptedAzure {
        requests: Mutex<Vec<AzureRequest>>,
        respond: Responder,
    }

    impl ScriptedAzure {
        pub fn new(
            respond: impl Fn(&AzureRequest) -> http::Response<Bytes> + Send + Sync + 'static,
        ) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        pub fn requests(&self) -> Vec<AzureRequest> {
            self.requests.lock().clone()
        }

        /// `METHOD path?k=v` per request, in order / 调用序列
        pub fn calls(&self) -> Vec<String> {
            self.requests().iter().map(call_line).collect()
        }

        pub fn clear(&self) {
            self.requests.lock().clear();
        }
    }

    pub fn call_line(request: &AzureRequest) -> String {
        let query: Vec<String> = request.query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        if query.is_empty() {
            format!("{} {}", request.method, request.path)
        } else {
            format!("{} {}?{}", request.method, request.path, query.join("&"))
        }
    }

    pub fn reply(status: u16) -> http::Response<Bytes> {
        reply_with(status, &[])
    }

    pub fn reply_with(status: u16, headers: &[(&str, String)]) -> http::Response<Bytes> {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        builder.body(Bytes::new()).unwrap()
    }

    pub fn has_query(request: &AzureRequest, name: &str, value: &str) -> bool {
        request.query.iter().any(|(k, v)| k == name && v == value)
    }

    #[async_trait]
    impl AzureClient for ScriptedAzure {
        fn resource_url(&self, path: &str) -> String {
            format!("https://acct.test.core.windows.net/{}", encode_path(path))
        }

        async fn send(&self, request: AzureRequest) -> Result<Response> {
            let response = (self.respond)(&request);
            self.requests.lock().push(request);
            Ok(Response::from(response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn signer() -> SharedKeySigner {
        // "secret-key" base64
        SharedKeySigner::new("myaccount", "c2VjcmV0LWtleQ==").unwrap()
    }

    #[test]
    fn test_string_to_sign_layout() {
        let request = AzureRequest::new(Method::PUT, "site/a b.txt")
            .query("comp", "appendblock")
            .header("x-ms-version", API_VERSION)
            .header("x-ms-date", "Mon, 01 Jan 2024 00:00:00 GMT")
            .header("Content-Type", "text/plain");
        let s = signer().string_to_sign(&request, "/site/a%20b.txt", 11);
        let lines: Vec<&str> = s.split('\n').collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[3], "11");
        assert_eq!(lines[5], "text/plain");
        assert_eq!(lines[12], "x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(lines[13], "x-ms-version:2021-12-02");
        assert_eq!(lines[14], "/myaccount/site/a%20b.txt");
        assert_eq!(lines[15], "comp:appendblock");
    }

    #[test]
    fn test_zero_length_is_blank() {
        let request = AzureRequest::new(Method::DELETE, "site/a.txt");
        let s = signer().string_to_sign(&request, "/site/a.txt", 0);
        assert_eq!(s.split('\n').nth(3), Some(""));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let s = signer();
        assert_eq!(s.sign("abc").unwrap(), s.sign("abc").unwrap());
        assert_ne!(s.sign("abc").unwrap(), s.sign("abd").unwrap());
        assert!(s.authorization("abc").unwrap().starts_with("SharedKey myaccount:"));
        assert!(SharedKeySigner::new("a", "not base64!").is_err());
    }

    #[test]
    fn test_encode_path_and_dates() {
        assert_eq!(encode_path("site/my dir/ä.txt"), "site/my%20dir/%C3%A4.txt");
        let t = parse_date("Wed, 03 Jan 2024 10:00:00 GMT").unwrap();
        assert_eq!(http_date(t), "Wed, 03 Jan 2024 10:00:00 GMT");
        assert!(parse_date("2024-01-03T10:00:00.0000000Z").is_some());
    }

    #[test]
    fn test_split_blocks() {
        let data = Bytes::from(vec![1u8; 10]);
        let blocks = split_blocks(&data, 4);
        assert_eq!(blocks.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert!(split_blocks(&Bytes::new(), 4).is_empty());
    }

    #[tokio::test]
    async fn test_execute_maps_status() {
        use scripted::{reply, reply_with, ScriptedAzure};
        let azure = ScriptedAzure::new(|request| match request.path.as_str() {
            "site/missing" => reply(404),
            "site/busy" => reply_with(503, &[("x-ms-error-code", "ServerBusy".to_string())]),
            _ => reply(200),
        });
        let head = |path: &str| AzureRequest::new(Method::HEAD, path);

        assert!(azure.execute_optional(head("site/missing")).await.unwrap().is_none());
        assert!(azure.execute_optional(head("site/a.txt")).await.unwrap().is_some());
        let err = azure.execute(head("site/busy")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("ServerBusy"));
        assert_eq!(azure.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_poll_until() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let seen = poll_until(Duration::from_secs(2), Duration::from_millis(5), move || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert!(seen);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let seen = poll_until(Duration::from_millis(20), Duration::from_millis(5), || async { Ok(false) })
            .await
            .unwrap();
        assert!(!seen);
    }
}
