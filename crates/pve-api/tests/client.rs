use pve_api::{Credentials, Params, PveClient, StatusAction, Upid};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn token_client(server: &MockServer) -> PveClient {
    PveClient::new(
        server.uri(),
        Credentials::ApiToken {
            user: "root@pam".into(),
            token_name: "pvm".into(),
            token_value: "secret".into(),
        },
        true,
    )
    .unwrap()
}

#[tokio::test]
async fn token_auth_header_and_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .and(header("Authorization", "PVEAPIToken=root@pam!pvm=secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "node": "pve1", "status": "online", "maxcpu": 16 },
                { "node": "pve2", "status": "offline" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let nodes = token_client(&server).nodes().await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].node, "pve1");
    assert_eq!(nodes[0].maxcpu, Some(16));
    assert_eq!(nodes[1].status.as_deref(), Some("offline"));
}

#[tokio::test]
async fn qemu_list_detects_templates() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "vmid": 100, "name": "web", "status": "running" },
                { "vmid": 9000, "name": "template-ubuntu-22.04", "status": "stopped", "template": 1 }
            ]
        })))
        .mount(&server)
        .await;

    let vms = token_client(&server).qemu_list("pve1").await.unwrap();
    assert!(!vms[0].is_template());
    assert!(vms[1].is_template());
    assert_eq!(vms[1].vmid, 9000);
}

#[tokio::test]
async fn create_posts_form_and_returns_upid() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu"))
        .and(body_string_contains("vmid=105"))
        .and(body_string_contains("name=web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": "UPID:pve1:0000ABCD:0001:65000000:qmcreate:105:root@pam:"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let params = Params::new().set("vmid", 105).set("name", "web");
    let upid = token_client(&server).qemu_create("pve1", &params).await.unwrap();
    assert_eq!(upid, Upid("UPID:pve1:0000ABCD:0001:65000000:qmcreate:105:root@pam:".into()));
}

#[tokio::test]
async fn missing_guest_is_reported_as_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu/404/status/current"))
        .respond_with(ResponseTemplate::new(500).set_body_string(
            r#"{"data":null,"message":"Configuration file 'nodes/pve1/qemu-server/404.conf' does not exist\n"}"#,
        ))
        .mount(&server)
        .await;

    let err = token_client(&server)
        .qemu_current_status("pve1", 404)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("404.conf"));
}

#[tokio::test]
async fn server_error_is_not_mistaken_for_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/101/status/start"))
        .respond_with(ResponseTemplate::new(500).set_body_string("VM is locked (backup)"))
        .mount(&server)
        .await;

    let err = token_client(&server)
        .qemu_status_action("pve1", 101, StatusAction::Start)
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.to_string().contains("VM is locked (backup)"));
}

#[tokio::test]
async fn delete_purges_disks() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api2/json/nodes/pve1/qemu/120"))
        .and(query_param("purge", "1"))
        .and(query_param("destroy-unreferenced-disks", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": "UPID:pve1:1:2:3:qmdestroy:120:root@pam:"
        })))
        .expect(1)
        .mount(&server)
        .await;

    token_client(&server).qemu_delete("pve1", 120).await.unwrap();
}

#[tokio::test]
async fn password_session_reauthenticates_once_on_401() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .and(body_string_contains("username=root%40pam"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "ticket": "PVE:root@pam:TICKET",
                "CSRFPreventionToken": "CSRF",
                "username": "root@pam"
            }
        })))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .and(header("Cookie", "PVEAuthCookie=PVE:root@pam:TICKET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let client = PveClient::new(
        server.uri(),
        Credentials::Password {
            user: "root@pam".into(),
            password: "hunter2".into(),
        },
        true,
    )
    .unwrap();

    let nodes = client.nodes().await.unwrap();
    assert!(nodes.is_empty());
}

#[tokio::test]
async fn writes_carry_csrf_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "ticket": "T", "CSRFPreventionToken": "CSRF-1", "username": "ops@pve" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/vzdump"))
        .and(header("CSRFPreventionToken", "CSRF-1"))
        .and(body_string_contains("storage=backups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": "UPID:pve1:1:2:3:vzdump:130:ops@pve:"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = PveClient::new(
        server.uri(),
        Credentials::Password {
            user: "ops@pve".into(),
            password: "pw".into(),
        },
        true,
    )
    .unwrap();

    let params = Params::new().set("vmid", 130).set("storage", "backups");
    client.vzdump("pve1", &params).await.unwrap();
}

#[tokio::test]
async fn rejected_login_is_an_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .respond_with(ResponseTemplate::new(401).set_body_string("authentication failure"))
        .mount(&server)
        .await;

    let client = PveClient::new(
        server.uri(),
        Credentials::Password {
            user: "root@pam".into(),
            password: "wrong".into(),
        },
        true,
    )
    .unwrap();

    let err = client.nodes().await.unwrap_err();
    assert!(matches!(err, pve_api::Error::Auth(_)));
}
