//! Request authorization for the reverse proxy.

use http::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, COOKIE};
use http::{Method, Request, Response, StatusCode};
use url::Url;

use super::{empty_body, text_body, GatewayBody};
use crate::registry::{AuthVerifier, Capability, Claims};
use crate::sni::ResolvedSni;

/// The `__Host-` prefix binds the cookie to this exact host over TLS.
pub const AUTH_COOKIE: &str = "__Host-flow_auth";

/// Path completing the dashboard's cookie-issuing flow.
pub const AUTH_REDIRECT_PATH: &str = "/auth-redirect";

/// Dashboard path which starts an authorization flow for a browser.
pub const DASHBOARD_AUTH_PATH: &str = "data-plane-auth-req";

/// The bearer token of the `Authorization` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_owned)
}

/// The auth cookie's value, if present on any `Cookie` header.
pub fn cookie_token(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(cookies) = header.to_str() else {
            continue;
        };
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == AUTH_COOKIE {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Drop the auth cookie from the request's `Cookie` headers, leaving other
/// cookies intact. The connector never sees platform credentials.
pub fn scrub_auth_cookie(headers: &mut HeaderMap) {
    let kept: Vec<HeaderValue> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| {
            let cookies = header.to_str().ok()?;
            let remaining: Vec<&str> = cookies
                .split(';')
                .map(str::trim)
                .filter(|pair| {
                    pair.split_once('=')
                        .map(|(name, _)| name != AUTH_COOKIE)
                        .unwrap_or(true)
                })
                .collect();
            if remaining.is_empty() {
                None
            } else {
                HeaderValue::from_str(&remaining.join("; ")).ok()
            }
        })
        .collect();

    headers.remove(COOKIE);
    for value in kept {
        headers.append(COOKIE, value);
    }
}

/// Whether an unauthorized response should redirect through the dashboard
/// rather than answer 403: interactive browsers ask for HTML.
pub fn looks_like_browser<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET
        && req
            .headers()
            .get(ACCEPT)
            .and_then(|accept| accept.to_str().ok())
            .is_some_and(|accept| accept.contains("html"))
}

/// Authorize one request against the verifier. The claims must cover the
/// resolved task by name.
pub async fn authorize<B>(
    req: &Request<B>,
    verifier: &dyn AuthVerifier,
    resolved: &ResolvedSni,
) -> anyhow::Result<Claims> {
    let token = bearer_token(req.headers())
        .or_else(|| cookie_token(req.headers()))
        .ok_or_else(|| anyhow::anyhow!("request carries no authorization"))?;

    let claims = verifier
        .verify(&token, Capability::NetworkProxy)
        .await?;

    let mut task_labels = crate::registry::LabelSet::default();
    task_labels.add(crate::registry::labels::TASK_NAME, &resolved.task_name);
    if !claims
        .selector
        .matches(&resolved.shard_id_prefix, &task_labels)
    {
        anyhow::bail!("authorization does not cover task {:?}", resolved.task_name);
    }
    Ok(claims)
}

/// Complete the cookie-setting handshake: `?token=...&orig_url=...` becomes
/// a secure HTTP-only cookie and a redirect back to where the user started.
pub fn complete_auth_redirect<B>(req: &Request<B>) -> Response<GatewayBody> {
    let query = req.uri().query().unwrap_or("");
    let mut token = None;
    let mut orig_url = None;
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match name.as_ref() {
            "token" => token = Some(value.into_owned()),
            "orig_url" => orig_url = Some(value.into_owned()),
            _ => {}
        }
    }
    let (Some(token), Some(orig_url)) = (token, orig_url) else {
        return text_body(
            StatusCode::BAD_REQUEST,
            "auth-redirect requires token and orig_url parameters\n",
        );
    };

    let cookie = format!("{AUTH_COOKIE}={token}; Secure; HttpOnly; Path=/");
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(http::header::SET_COOKIE, cookie)
        .header(http::header::LOCATION, orig_url)
        .body(empty_body())
        .expect("static response builds")
}

/// Answer an unauthorized request: browsers are sent through the dashboard
/// auth flow, everything else gets a 403.
pub fn unauthorized_response<B>(
    req: &Request<B>,
    resolved: &ResolvedSni,
    original_url: &str,
    dashboard: &Url,
    reason: &anyhow::Error,
) -> Response<GatewayBody> {
    if !looks_like_browser(req) {
        return text_body(StatusCode::FORBIDDEN, "Forbidden\n");
    }

    let mut location = match dashboard.join(DASHBOARD_AUTH_PATH) {
        Ok(location) => location,
        Err(_) => return text_body(StatusCode::FORBIDDEN, "Forbidden\n"),
    };
    location
        .query_pairs_mut()
        .append_pair("orig_url", original_url)
        .append_pair("task", &resolved.task_name)
        .append_pair("prefix", &resolved.shard_id_prefix)
        .append_pair("err", &reason.to_string());

    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(http::header::LOCATION, location.as_str())
        .body(empty_body())
        .expect("static response builds")
}

/// Verifier accepting a fixed list of bearer tokens, granting match-all
/// claims. Stands in for the control-plane verifier in standalone
/// deployments; real deployments implement [`AuthVerifier`] against their
/// token service.
pub struct StaticTokenVerifier {
    tokens: Vec<String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}

#[async_trait::async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str, _capability: Capability) -> anyhow::Result<Claims> {
        if self.tokens.iter().any(|t| t == token) {
            Ok(Claims::network_proxy(Default::default()))
        } else {
            anyhow::bail!("unknown token")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn resolved() -> ResolvedSni {
        ResolvedSni {
            shard_id_prefix: "capture/AcmeCo/My/Capture/source-http-ingest/".into(),
            port_protocol: None,
            port_is_public: false,
            task_name: "AcmeCo/My/Capture/source-http-ingest".into(),
        }
    }

    #[test]
    fn extracts_bearer_and_cookie_tokens() {
        let req = request(
            Method::GET,
            "/x",
            &[("authorization", "Bearer tok-1")],
        );
        assert_eq!(bearer_token(req.headers()).as_deref(), Some("tok-1"));

        let req = request(
            Method::GET,
            "/x",
            &[("cookie", "a=b; __Host-flow_auth=tok-2; c=d")],
        );
        assert_eq!(cookie_token(req.headers()).as_deref(), Some("tok-2"));
        assert_eq!(bearer_token(req.headers()), None);
    }

    #[test]
    fn scrubs_only_the_auth_cookie() {
        let mut req = request(
            Method::GET,
            "/x",
            &[("cookie", "a=b; __Host-flow_auth=secret; c=d")],
        );
        scrub_auth_cookie(req.headers_mut());
        assert_eq!(
            req.headers().get(COOKIE).unwrap().to_str().unwrap(),
            "a=b; c=d"
        );

        let mut req = request(Method::GET, "/x", &[("cookie", "__Host-flow_auth=secret")]);
        scrub_auth_cookie(req.headers_mut());
        assert!(req.headers().get(COOKIE).is_none());
    }

    #[test]
    fn browser_detection() {
        assert!(looks_like_browser(&request(
            Method::GET,
            "/x",
            &[("accept", "text/html,application/xhtml+xml")],
        )));
        assert!(!looks_like_browser(&request(
            Method::GET,
            "/x",
            &[("accept", "application/json")],
        )));
        assert!(!looks_like_browser(&request(
            Method::POST,
            "/x",
            &[("accept", "text/html")],
        )));
    }

    #[test]
    fn auth_redirect_sets_cookie_and_redirects() {
        let req = request(
            Method::GET,
            "/auth-redirect?token=tok&orig_url=https%3A%2F%2Fabc-9000.gw.example%2Fpath",
            &[],
        );
        let resp = complete_auth_redirect(&req);
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            resp.headers().get(http::header::LOCATION).unwrap(),
            "https://abc-9000.gw.example/path"
        );
        let cookie = resp
            .headers()
            .get(http::header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(cookie, "__Host-flow_auth=tok; Secure; HttpOnly; Path=/");
    }

    #[test]
    fn auth_redirect_requires_parameters() {
        let resp = complete_auth_redirect(&request(Method::GET, "/auth-redirect?token=t", &[]));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unauthorized_browser_is_redirected_with_context() {
        let req = request(Method::GET, "/path", &[("accept", "text/html")]);
        let dashboard = Url::parse("https://dashboard.example/").unwrap();
        let resp = unauthorized_response(
            &req,
            &resolved(),
            "https://abc-9000.gw.example/path",
            &dashboard,
            &anyhow::anyhow!("no token"),
        );
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);

        let location = resp
            .headers()
            .get(http::header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        let location = Url::parse(location).unwrap();
        assert_eq!(location.path(), "/data-plane-auth-req");
        let pairs: std::collections::HashMap<String, String> =
            location.query_pairs().into_owned().collect();
        assert_eq!(pairs["orig_url"], "https://abc-9000.gw.example/path");
        assert_eq!(pairs["task"], "AcmeCo/My/Capture/source-http-ingest");
        assert_eq!(
            pairs["prefix"],
            "capture/AcmeCo/My/Capture/source-http-ingest/"
        );
        assert_eq!(pairs["err"], "no token");
    }

    #[test]
    fn unauthorized_non_browser_is_forbidden() {
        let req = request(Method::POST, "/path", &[]);
        let dashboard = Url::parse("https://dashboard.example/").unwrap();
        let resp = unauthorized_response(
            &req,
            &resolved(),
            "https://abc-9000.gw.example/path",
            &dashboard,
            &anyhow::anyhow!("no token"),
        );
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn authorize_matches_claims_against_task() {
        let verifier = StaticTokenVerifier::new(vec!["good".into()]);

        let req = request(Method::GET, "/x", &[("authorization", "Bearer good")]);
        assert!(authorize(&req, &verifier, &resolved()).await.is_ok());

        let req = request(Method::GET, "/x", &[("authorization", "Bearer bad")]);
        assert!(authorize(&req, &verifier, &resolved()).await.is_err());

        let req = request(Method::GET, "/x", &[]);
        assert!(authorize(&req, &verifier, &resolved()).await.is_err());
    }

    #[tokio::test]
    async fn collected_bodies_are_empty_for_redirects() {
        let req = request(Method::GET, "/auth-redirect?token=t&orig_url=u", &[]);
        let resp = complete_auth_redirect(&req);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
