use crate::oci::{self, MEDIA_TYPES_ACCEPTED};
use crate::{sha256_digest, verify_digest, FetchedManifest, ImageRef, RegistryClient, RegistryConfig, RegistryError};
use ferry_schema::Digest;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

type Response = ureq::http::Response<ureq::Body>;

/// Registry client over the OCI distribution API.
///
/// - `HEAD /v2/<repo>/manifests/<tag>`    : resolve a tag via `Docker-Content-Digest`
/// - `GET  /v2/<repo>/manifests/<digest>` : manifest or index
/// - `GET  /v2/<repo>/blobs/<digest>`     : config and layer blobs
///
/// A `401` carrying a `Bearer` challenge triggers anonymous token negotiation
/// against the advertised realm; the token is cached per repository.
pub struct HttpRegistry {
    config: RegistryConfig,
    agent: ureq::Agent,
    tokens: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl HttpRegistry {
    /// `timeout` bounds each individual HTTP request.
    pub fn new(config: RegistryConfig, timeout: Duration) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            config,
            agent: ureq::Agent::new_with_config(agent_config),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, image: &ImageRef, kind: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/{kind}/{reference}",
            self.config.base_url(image.api_host()),
            image.repository()
        )
    }

    fn token_key(image: &ImageRef) -> String {
        format!("{}/{}", image.api_host(), image.repository())
    }

    fn bearer_for(&self, image: &ImageRef) -> Option<String> {
        if let Some(token) = self.config.token_for(image.registry()) {
            return Some(token.to_owned());
        }
        if let Some(token) = self.config.token_for(image.api_host()) {
            return Some(token.to_owned());
        }
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::token_key(image))
            .cloned()
    }

    fn call(
        &self,
        image: &ImageRef,
        url: &str,
        head: bool,
        accept: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let mut negotiated = false;
        loop {
            let mut req = if head {
                self.agent.head(url)
            } else {
                self.agent.get(url)
            };
            if let Some(accept) = accept {
                req = req.header("Accept", accept);
            }
            if let Some(token) = self.bearer_for(image) {
                req = req.header("Authorization", &format!("Bearer {token}"));
            }
            let resp = req
                .call()
                .map_err(|e| RegistryError::Http(format!("{url}: {e}")))?;

            match resp.status().as_u16() {
                200..=299 => return Ok(resp),
                401 if !negotiated => {
                    let challenge = header(&resp, "www-authenticate")
                        .ok_or_else(|| RegistryError::Unauthorized(url.to_owned()))?;
                    let token = self.negotiate_token(image, &challenge)?;
                    self.tokens
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(Self::token_key(image), token);
                    negotiated = true;
                }
                401 | 403 => return Err(RegistryError::Unauthorized(url.to_owned())),
                404 => return Err(RegistryError::NotFound(url.to_owned())),
                code => return Err(RegistryError::Http(format!("HTTP {code} for {url}"))),
            }
        }
    }

    fn negotiate_token(&self, image: &ImageRef, challenge: &str) -> Result<String, RegistryError> {
        let params = parse_challenge(challenge)
            .ok_or_else(|| RegistryError::Unauthorized(format!("unsupported challenge: {challenge}")))?;
        let realm = params
            .get("realm")
            .ok_or_else(|| RegistryError::Unauthorized("challenge without realm".to_owned()))?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", image.repository()));
        let mut url = format!("{realm}?scope={scope}");
        if let Some(service) = params.get("service") {
            url.push_str(&format!("&service={service}"));
        }
        tracing::debug!("requesting registry token from {realm}");

        let resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| RegistryError::Http(format!("{realm}: {e}")))?;
        if resp.status().as_u16() != 200 {
            return Err(RegistryError::Unauthorized(format!(
                "token endpoint returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        let body = read_body(resp)?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Malformed(format!("token response: {e}")))?;
        parsed
            .token
            .or(parsed.access_token)
            .ok_or_else(|| RegistryError::Unauthorized("token response without token".to_owned()))
    }
}

fn header(resp: &Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn read_body(resp: Response) -> Result<Vec<u8>, RegistryError> {
    let mut reader = resp.into_body().into_reader();
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|e| RegistryError::Http(e.to_string()))?;
    Ok(body)
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_challenge(challenge: &str) -> Option<HashMap<String, String>> {
    let (scheme, rest) = challenge.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let mut params = HashMap::new();
    let mut rest = rest.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, value.to_owned());
        rest = remainder.trim_start_matches(',').trim();
    }
    Some(params)
}

/// Media type from `Content-Type`, falling back to the document's `mediaType`.
fn manifest_media_type(content_type: Option<&str>, body: &[u8]) -> String {
    let declared = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_owned())
        .filter(|ct| oci::is_index(ct) || oci::is_manifest(ct));
    if let Some(ct) = declared {
        return ct;
    }
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "mediaType", default)]
        media_type: Option<String>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
    }
    match serde_json::from_slice::<Probe>(body) {
        Ok(Probe {
            media_type: Some(mt), ..
        }) => mt,
        Ok(Probe {
            manifests: Some(_), ..
        }) => oci::OCI_INDEX.to_owned(),
        _ => oci::OCI_MANIFEST.to_owned(),
    }
}

impl RegistryClient for HttpRegistry {
    fn resolve(&self, image: &ImageRef) -> Result<Digest, RegistryError> {
        if let Some(digest) = image.digest() {
            return Ok(digest.clone());
        }
        let url = self.url(image, "manifests", &image.manifest_reference());
        tracing::debug!("HEAD {url}");
        let resp = self.call(image, &url, true, Some(MEDIA_TYPES_ACCEPTED))?;
        if let Some(digest) = header(&resp, "docker-content-digest").and_then(|d| Digest::parse(&d)) {
            return Ok(digest);
        }

        // No digest header: hash the manifest as served.
        tracing::debug!("GET {url}");
        let resp = self.call(image, &url, false, Some(MEDIA_TYPES_ACCEPTED))?;
        Ok(sha256_digest(&read_body(resp)?))
    }

    fn fetch_manifest(&self, image: &ImageRef, digest: &Digest) -> Result<FetchedManifest, RegistryError> {
        let url = self.url(image, "manifests", digest);
        tracing::debug!("GET {url}");
        let resp = self.call(image, &url, false, Some(MEDIA_TYPES_ACCEPTED))?;
        let content_type = header(&resp, "content-type");
        let bytes = read_body(resp)?;
        verify_digest(&url, digest, &bytes)?;
        Ok(FetchedManifest {
            media_type: manifest_media_type(content_type.as_deref(), &bytes),
            bytes,
        })
    }

    fn fetch_blob(
        &self,
        image: &ImageRef,
        digest: &Digest,
        dest: &mut dyn Write,
    ) -> Result<u64, RegistryError> {
        let url = self.url(image, "blobs", digest);
        tracing::debug!("GET {url}");
        let resp = self.call(image, &url, false, None)?;
        let mut reader = resp.into_body().into_reader();
        let copied = io::copy(&mut reader, dest)?;
        tracing::debug!("{url}: {copied} bytes");
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegistryAuth;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        path: String,
        headers: HashMap<String, String>,
    }

    #[derive(Clone)]
    struct Route {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Route {
        fn ok(content_type: &str, body: &[u8]) -> Self {
            Self {
                status: 200,
                headers: vec![("Content-Type".to_owned(), content_type.to_owned())],
                body: body.to_vec(),
            }
        }
    }

    /// Minimal registry: fixed routes by path, optional bearer requirement.
    struct MockServer {
        addr: String,
        host: String,
        routes: Arc<Mutex<HashMap<String, Route>>>,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
        required_token: Arc<Mutex<Option<String>>>,
    }

    impl MockServer {
        fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let host = listener.local_addr().unwrap().to_string();
            let addr = format!("http://{host}");
            let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::new(Mutex::new(HashMap::new()));
            let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
            let required_token: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

            let routes_c = Arc::clone(&routes);
            let requests_c = Arc::clone(&requests);
            let token_c = Arc::clone(&required_token);
            let realm = format!("{addr}/token");
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let routes = Arc::clone(&routes_c);
                    let reqs = Arc::clone(&requests_c);
                    let token = Arc::clone(&token_c);
                    let realm = realm.clone();
                    std::thread::spawn(move || {
                        let mut reader = BufReader::new(stream.try_clone().unwrap());
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).is_err() {
                            return;
                        }
                        let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                        if parts.len() < 2 {
                            return;
                        }
                        let method = parts[0].to_owned();
                        let full_path = parts[1].to_owned();
                        let path = full_path.split('?').next().unwrap_or("").to_owned();

                        let mut headers = HashMap::new();
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                                break;
                            }
                            if let Some((k, v)) = line.trim().split_once(": ") {
                                headers.insert(k.to_lowercase(), v.to_owned());
                            }
                        }
                        reqs.lock().unwrap().push(CapturedRequest {
                            method: method.clone(),
                            path: full_path.clone(),
                            headers: headers.clone(),
                        });

                        let required = token.lock().unwrap().clone();
                        let route = if path == "/token" {
                            let t = required.clone().unwrap_or_default();
                            Route::ok("application/json", format!(r#"{{"token":"{t}"}}"#).as_bytes())
                        } else if required.is_some_and(|t| {
                            headers.get("authorization") != Some(&format!("Bearer {t}"))
                        }) {
                            Route {
                                status: 401,
                                headers: vec![(
                                    "WWW-Authenticate".to_owned(),
                                    format!(r#"Bearer realm="{realm}",service="mock",scope="repository:library/app:pull""#),
                                )],
                                body: Vec::new(),
                            }
                        } else {
                            routes.lock().unwrap().get(&path).cloned().unwrap_or(Route {
                                status: 404,
                                headers: Vec::new(),
                                body: Vec::new(),
                            })
                        };

                        let mut response = format!("HTTP/1.1 {} X\r\n", route.status);
                        for (k, v) in &route.headers {
                            response.push_str(&format!("{k}: {v}\r\n"));
                        }
                        response.push_str(&format!(
                            "Content-Length: {}\r\nConnection: close\r\n\r\n",
                            route.body.len()
                        ));
                        let _ = stream.write_all(response.as_bytes());
                        if method != "HEAD" {
                            let _ = stream.write_all(&route.body);
                        }
                        let _ = stream.flush();
                    });
                }
            });

            MockServer {
                addr,
                host,
                routes,
                requests,
                required_token,
            }
        }

        fn route(&self, path: &str, route: Route) {
            self.routes.lock().unwrap().insert(path.to_owned(), route);
        }

        fn require_token(&self, token: &str) {
            *self.required_token.lock().unwrap() = Some(token.to_owned());
        }

        fn captured(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn client(&self) -> HttpRegistry {
            HttpRegistry::new(
                RegistryConfig {
                    insecure: vec![self.host.clone()],
                    auth: Vec::new(),
                },
                Duration::from_secs(5),
            )
        }

        fn image(&self, rest: &str) -> ImageRef {
            ImageRef::parse(&format!("{}/{rest}", self.host)).unwrap()
        }
    }

    const MANIFEST: &[u8] = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:00","size":2},"layers":[]}"#;

    #[test]
    fn resolve_uses_digest_header() {
        let server = MockServer::start();
        let digest = sha256_digest(MANIFEST);
        let mut route = Route::ok(oci::OCI_MANIFEST, MANIFEST);
        route
            .headers
            .push(("Docker-Content-Digest".to_owned(), digest.to_string()));
        server.route("/v2/library/app/manifests/1.0", route);

        let client = server.client();
        let resolved = client.resolve(&server.image("library/app:1.0")).unwrap();
        assert_eq!(resolved, digest);
        let reqs = server.captured();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, "HEAD");
        assert!(reqs[0].headers["accept"].contains(oci::OCI_INDEX));
    }

    #[test]
    fn resolve_hashes_body_without_header() {
        let server = MockServer::start();
        server.route("/v2/library/app/manifests/1.0", Route::ok(oci::OCI_MANIFEST, MANIFEST));
        let resolved = server.client().resolve(&server.image("library/app:1.0")).unwrap();
        assert_eq!(resolved, sha256_digest(MANIFEST));
    }

    #[test]
    fn pinned_reference_resolves_offline() {
        let digest = sha256_digest(MANIFEST);
        let client = HttpRegistry::new(RegistryConfig::default(), Duration::from_millis(100));
        let image = ImageRef::parse(&format!("127.0.0.1:1/app@{digest}")).unwrap();
        assert_eq!(client.resolve(&image).unwrap(), digest);
    }

    #[test]
    fn fetch_manifest_verifies_digest() {
        let server = MockServer::start();
        let digest = sha256_digest(MANIFEST);
        server.route(
            &format!("/v2/library/app/manifests/{digest}"),
            Route::ok(oci::OCI_MANIFEST, MANIFEST),
        );
        let client = server.client();
        let image = server.image("library/app:1.0");
        let fetched = client.fetch_manifest(&image, &digest).unwrap();
        assert_eq!(fetched.media_type, oci::OCI_MANIFEST);
        assert_eq!(fetched.bytes, MANIFEST);

        let wrong = sha256_digest(b"something else");
        server.route(
            &format!("/v2/library/app/manifests/{wrong}"),
            Route::ok(oci::OCI_MANIFEST, MANIFEST),
        );
        assert!(matches!(
            client.fetch_manifest(&image, &wrong),
            Err(RegistryError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn media_type_sniffed_from_body() {
        let server = MockServer::start();
        let index = br#"{"schemaVersion":2,"manifests":[]}"#;
        let digest = sha256_digest(index);
        server.route(
            &format!("/v2/library/app/manifests/{digest}"),
            Route::ok("application/json", index),
        );
        let fetched = server
            .client()
            .fetch_manifest(&server.image("library/app"), &digest)
            .unwrap();
        assert_eq!(fetched.media_type, oci::OCI_INDEX);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let server = MockServer::start();
        let digest = sha256_digest(b"layer");
        let mut sink = Vec::new();
        let result = server
            .client()
            .fetch_blob(&server.image("library/app"), &digest, &mut sink);
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert!(sink.is_empty());
    }

    #[test]
    fn blob_roundtrip() {
        let server = MockServer::start();
        let data: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        let digest = sha256_digest(&data);
        server.route(
            &format!("/v2/library/app/blobs/{digest}"),
            Route::ok("application/octet-stream", &data),
        );
        let mut writer = crate::DigestWriter::new(Vec::new());
        let copied = server
            .client()
            .fetch_blob(&server.image("library/app"), &digest, &mut writer)
            .unwrap();
        assert_eq!(copied, data.len() as u64);
        let (blob, _) = writer.verify("blob", &digest).unwrap();
        assert_eq!(blob, data);
    }

    #[test]
    fn configured_token_is_sent() {
        let server = MockServer::start();
        server.route("/v2/library/app/manifests/1.0", Route::ok(oci::OCI_MANIFEST, MANIFEST));
        let client = HttpRegistry::new(
            RegistryConfig {
                insecure: vec![server.host.clone()],
                auth: vec![RegistryAuth {
                    host: server.host.clone(),
                    token: "secret-42".to_owned(),
                }],
            },
            Duration::from_secs(5),
        );
        client.resolve(&server.image("library/app:1.0")).unwrap();
        let reqs = server.captured();
        assert_eq!(
            reqs[0].headers.get("authorization"),
            Some(&"Bearer secret-42".to_owned())
        );
    }

    #[test]
    fn bearer_challenge_is_negotiated() {
        let server = MockServer::start();
        server.require_token("anon-token");
        server.route("/v2/library/app/manifests/1.0", Route::ok(oci::OCI_MANIFEST, MANIFEST));

        let client = server.client();
        let image = server.image("library/app:1.0");
        client.resolve(&image).unwrap();
        client.resolve(&image).unwrap();

        let reqs = server.captured();
        let token_requests: Vec<_> = reqs.iter().filter(|r| r.path.starts_with("/token")).collect();
        assert_eq!(token_requests.len(), 1, "token must be cached");
        assert!(token_requests[0].path.contains("scope=repository:library/app:pull"));
        assert!(token_requests[0].path.contains("service=mock"));
    }

    #[test]
    fn connection_refused_returns_error() {
        let client = HttpRegistry::new(
            RegistryConfig {
                insecure: vec!["127.0.0.1:1".to_owned()],
                auth: Vec::new(),
            },
            Duration::from_secs(2),
        );
        let image = ImageRef::parse("127.0.0.1:1/app:1").unwrap();
        assert!(matches!(client.resolve(&image), Err(RegistryError::Http(_))));
    }

    #[test]
    fn challenge_parsing() {
        let p = parse_challenge(
            r#"Bearer realm="https://auth.example/token",service="reg",scope="repository:a/b:pull,push""#,
        )
        .unwrap();
        assert_eq!(p["realm"], "https://auth.example/token");
        assert_eq!(p["service"], "reg");
        assert_eq!(p["scope"], "repository:a/b:pull,push");
        assert!(parse_challenge("Basic realm=\"x\"").is_none());
    }
}
