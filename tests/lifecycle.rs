//! End-to-end lifecycle scenarios driven through the service façade
//! against a recording fake host.

use std::sync::Arc;
use std::time::Duration;

use ipscell::config::Config;
use ipscell::proto::{
    AlternativesMode, Event, GenericName, ResponseStatus, SendEventRequest, State,
};
use ipscell::service::LxcSandboxService;
use ipscell_host::fake::{FakeEffect, FakeHost};

const CONFIG: &str = "lxc.network.link = lxcbr0\nlxc.network.hwaddr = 00:11:22:33:44:55\n";
const LEASES: &str = "1375315200 00:11:22:33:44:55 192.168.1.1 example *\n";

fn service(host: Arc<FakeHost>) -> LxcSandboxService {
    LxcSandboxService::new(host, Config::default())
}

async fn wait_for_state(service: &LxcSandboxService, id: &str, state: State) {
    for _ in 0..200 {
        if service.get_state(id).await.state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("sandbox {id} never reached {state}");
}

#[tokio::test]
async fn healthz_gates_ready_against_boot() {
    let host = Arc::new(
        FakeHost::new()
            .with_file("/var/lib/lxc/example/config", CONFIG)
            .with_file("/var/lib/lxc/example/ports", "1\n2 statusz\n3")
            .with_file("/var/lib/misc/dnsmasq.leases", LEASES)
            .with_cmd("lxc-info -n example | grep state:", "state: RUNNING")
            .with_url("http://192.168.1.1:2/healthz", "ok"),
    );
    let service = service(host.clone());

    assert_eq!(service.get_state("example").await.state, State::Ready);

    host.set_url("http://192.168.1.1:2/healthz", "NG");
    assert_eq!(service.get_state("example").await.state, State::Boot);
}

#[tokio::test]
async fn ready_sandbox_rejects_start() {
    let host = Arc::new(
        FakeHost::new()
            .with_file("/var/lib/lxc/example/config", CONFIG)
            .with_file("/var/lib/lxc/example/ports", "1\n2 statusz\n3")
            .with_file("/var/lib/misc/dnsmasq.leases", LEASES)
            .with_cmd("lxc-info -n example | grep state:", "state: RUNNING")
            .with_url("http://192.168.1.1:2/healthz", "ok"),
    );
    let service = service(host.clone());

    let response = service
        .send_event("example", SendEventRequest::new(Event::Start))
        .await;
    assert_eq!(response.status, ResponseStatus::Failed);
    assert_eq!(
        response.description,
        "START not allowed in the current status."
    );
    assert!(host
        .calls()
        .iter()
        .all(|cmd| !cmd.starts_with("lxc-start") && !cmd.starts_with("/sbin/iptables -I")));
}

#[tokio::test]
async fn alternatives_switch_between_versions() {
    let name = GenericName::new("myRole", "me");
    let query_auto = "\
Name: ips-sandbox_myRole.me
Link: /var/lib/ips-cell/sandbox/me/myRole.me
Status: auto
Best: /var/lib/lxc/v2
Value: /var/lib/lxc/v2

Alternative: /var/lib/lxc/v1
Priority: 10

Alternative: /var/lib/lxc/v2
Priority: 20
";
    let query_manual = query_auto
        .replace("Status: auto", "Status: manual")
        .replace("Value: /var/lib/lxc/v2", "Value: /var/lib/lxc/v1");

    let host = Arc::new(
        FakeHost::new()
            .with_cmd("update-alternatives --auto ips-sandbox_myRole.me", "")
            .with_cmd(
                "update-alternatives --set ips-sandbox_myRole.me /var/lib/lxc/v1",
                "",
            )
            .with_cmd("update-alternatives --query ips-sandbox_myRole.me", query_auto)
            .with_file("/var/lib/lxc/v1/sandbox.proto", "sandbox_id: \"v1\"\n")
            .with_file("/var/lib/lxc/v2/sandbox.proto", "sandbox_id: \"v2\"\n"),
    );
    let service = service(host.clone());

    // AUTO selection: the higher priority wins.
    let response = service.set_alternative(&name, None).await;
    assert_eq!(response.status, ResponseStatus::Success);
    let view = service.get_alternatives(&name).await;
    assert_eq!(view.mode, AlternativesMode::Auto);
    assert_eq!(view.current_sandbox_id, "v2");
    assert_eq!(view.alternatives.len(), 2);

    // Pinning v1 flips the registry to MANUAL.
    let response = service.set_alternative(&name, Some("v1")).await;
    assert_eq!(response.status, ResponseStatus::Success);
    host.set_cmd(
        "update-alternatives --query ips-sandbox_myRole.me",
        query_manual,
    );
    let view = service.get_alternatives(&name).await;
    assert_eq!(view.mode, AlternativesMode::Manual);
    assert_eq!(view.current_sandbox_id, "v1");

    assert!(host
        .calls()
        .iter()
        .any(|cmd| cmd == "update-alternatives --auto ips-sandbox_myRole.me"));
    assert!(host
        .calls()
        .iter()
        .any(|cmd| cmd == "update-alternatives --set ips-sandbox_myRole.me /var/lib/lxc/v1"));
}

#[tokio::test]
async fn archive_then_destroy() {
    let tar_cmd = "tar --checkpoint=1000 -jcf \
                   /var/lib/ips-cell/sandbox/archive/example.tar.bz2.$$ -C /var/lib/lxc example \
                   && mv /var/lib/ips-cell/sandbox/archive/example.tar.bz2.$$ \
                   /var/lib/ips-cell/sandbox/archive/example.tar.bz2";
    let host = Arc::new(
        FakeHost::new()
            .with_file("/var/lib/lxc/example/config", CONFIG)
            .with_file(
                "/var/lib/lxc/example/sandbox.proto",
                "sandbox_id: \"example\"\nrole: \"web\"\nowner: \"alice\"\n",
            )
            .with_dir("/var/lib/lxc/example/rootfs")
            .with_cmd("lxc-info -n example | grep state:", "state: STOPPED")
            .with_cmd(tar_cmd, "tar: Write checkpoint 1000\n")
            .with_cmd_effect(
                tar_cmd,
                FakeEffect::WriteFile(
                    "/var/lib/ips-cell/sandbox/archive/example.tar.bz2".into(),
                    "tarball".into(),
                ),
            )
            .with_cmd("lxc-destroy -n example", "")
            .with_cmd_effect(
                "lxc-destroy -n example",
                FakeEffect::RemoveFile("/var/lib/lxc/example/config".into()),
            )
            .with_cmd_effect(
                "lxc-destroy -n example",
                FakeEffect::RemoveFile("/var/lib/lxc/example/sandbox.proto".into()),
            )
            .with_cmd(
                "update-alternatives --remove ips-sandbox_web.alice /var/lib/lxc/example",
                "",
            )
            .with_cmd(
                "update-alternatives --remove ips-sandbox_. /var/lib/lxc/example",
                "",
            ),
    );
    let service = service(host.clone());

    assert_eq!(service.get_state("example").await.state, State::Stop);

    let response = service
        .send_event("example", SendEventRequest::new(Event::Archive))
        .await;
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.description, "Waiting");

    wait_for_state(&service, "example", State::Archived).await;
    assert!(host
        .file("/var/lib/ips-cell/sandbox/archive/example.tar.bz2")
        .is_some());
    assert!(host.file("/var/lib/lxc/example/config").is_none());

    // Archiving already unregistered the real generic name.
    assert!(host
        .calls()
        .iter()
        .any(|cmd| cmd == "update-alternatives --remove ips-sandbox_web.alice /var/lib/lxc/example"));

    let response = service
        .send_event("example", SendEventRequest::new(Event::Destroy))
        .await;
    assert_eq!(response.status, ResponseStatus::Success);

    // The archive itself stays; the sandbox remains ARCHIVED.
    assert_eq!(service.get_state("example").await.state, State::Archived);
}

#[tokio::test]
async fn archived_sandbox_appears_in_listing() {
    let host = Arc::new(
        FakeHost::new().with_file("/var/lib/ips-cell/sandbox/archive/example.tar.bz2", ""),
    );
    let service = service(host);
    assert_eq!(service.get_sandboxes().await, vec!["example"]);
    assert_eq!(service.get_state("example").await.state, State::Archived);
}
