use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_wiki::{app, MockWiki, SESSION_COOKIE};
use serde_json::Value;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn form_request(body: &str) -> Request<String> {
    Request::builder()
        .method("POST")
        .uri("/api.php")
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body.to_string())
        .unwrap()
}

fn wiki() -> MockWiki {
    MockWiki::new().with_user("username", "password")
}

// --- login ---

#[tokio::test]
async fn login_without_name_is_no_name() {
    let resp = app(wiki())
        .oneshot(form_request("action=login&format=json"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["login"]["result"], "NoName");
}

#[tokio::test]
async fn login_round_one_returns_token_and_session() {
    let wiki = wiki();
    let resp = app(wiki.clone())
        .oneshot(form_request("action=login&lgname=username"))
        .await
        .unwrap();

    let json = body_json(resp).await;
    assert_eq!(json["login"]["result"], "NeedToken");
    assert_eq!(json["login"]["token"], wiki.login_token().as_str());
    assert_eq!(json["login"]["sessionid"], wiki.session_id().as_str());
}

#[tokio::test]
async fn login_round_two_succeeds_with_issued_token() {
    let wiki = wiki();
    let body = format!(
        "action=login&lgname=username&lgpassword=password&lgtoken={}",
        wiki.login_token()
    );
    let resp = app(wiki).oneshot(form_request(&body)).await.unwrap();

    let json = body_json(resp).await;
    assert_eq!(json["login"]["result"], "Success");
    assert_eq!(json["login"]["lguserid"], 1);
    assert_eq!(json["login"]["lgusername"], "username");
}

#[tokio::test]
async fn login_with_foreign_token_is_wrong_token() {
    let resp = app(wiki())
        .oneshot(form_request(
            "action=login&lgname=username&lgpassword=password&lgtoken=deadbeef",
        ))
        .await
        .unwrap();

    let json = body_json(resp).await;
    assert_eq!(json["login"]["result"], "WrongToken");
}

// --- cookies ---

#[tokio::test]
async fn session_cookie_is_set_once() {
    let resp = app(wiki())
        .oneshot(form_request("action=logout"))
        .await
        .unwrap();
    let set_cookie = resp
        .headers()
        .get(http::header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with(&format!("{SESSION_COOKIE}=")));

    let mut request = form_request("action=logout");
    request.headers_mut().insert(
        http::header::COOKIE,
        set_cookie.split(';').next().unwrap().parse().unwrap(),
    );
    let resp = app(wiki()).oneshot(request).await.unwrap();
    assert!(resp.headers().get(http::header::SET_COOKIE).is_none());
}

// --- maxlag ---

#[tokio::test]
async fn lagged_response_carries_busy_headers() {
    let wiki = wiki().with_lag(1, 2);
    let resp = app(wiki.clone())
        .oneshot(form_request("action=query&meta=siteinfo&maxlag=5"))
        .await
        .unwrap();

    assert_eq!(resp.headers()["x-database-lag"], "10");
    assert_eq!(resp.headers()[http::header::RETRY_AFTER], "2");
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "maxlag");

    let resp = app(wiki)
        .oneshot(form_request("action=query&meta=siteinfo&maxlag=5"))
        .await
        .unwrap();
    assert!(resp.headers().get(http::header::RETRY_AFTER).is_none());
    let json = body_json(resp).await;
    assert_eq!(json["query"]["general"]["sitename"], "Mock Wiki");
}

#[tokio::test]
async fn lag_ignored_without_maxlag_param() {
    let wiki = wiki().with_lag(5, 1);
    let resp = app(wiki)
        .oneshot(form_request("action=query&meta=siteinfo"))
        .await
        .unwrap();

    assert!(resp.headers().get("x-database-lag").is_none());
}

// --- get ---

#[tokio::test]
async fn get_reads_query_string() {
    let wiki = wiki();
    let resp = app(wiki.clone())
        .oneshot(
            Request::builder()
                .uri("/api.php?action=query&meta=tokens&type=csrf")
                .body(String::new())
                .unwrap(),
        )
        .await
        .unwrap();

    let json = body_json(resp).await;
    assert_eq!(json["query"]["tokens"]["csrftoken"], wiki.csrf_token().as_str());
    assert_eq!(wiki.requests()[0].params["type"], "csrf");
}

// --- recording ---

#[tokio::test]
async fn requests_are_recorded() {
    let wiki = wiki();
    app(wiki.clone())
        .oneshot(form_request("action=edit&title=Sandbox&token=x"))
        .await
        .unwrap();

    let requests = wiki.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].params["title"], "Sandbox");
    assert!(requests[0].cookie.is_none());
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let resp = app(wiki())
        .oneshot(Request::builder().uri("/index.php").body(String::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(body_bytes(resp).await.is_empty());
}
