//! End-to-end tests for the web interface, driving a live server over HTTP.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serial_test::serial;
use tempfile::{TempDir, tempdir};

use deployd::auth::FileAuthenticator;
use deployd::task::DeployState;
use deployd::web::{Controller, WebServer};

struct TestServer {
    base: String,
    controller: Arc<Controller>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    deploy_dir: TempDir,
}

impl TestServer {
    fn start() -> Self {
        let deploy_dir = tempdir().expect("tempdir");
        let auth_file = deploy_dir.path().join("credentials");
        fs::write(
            &auth_file,
            format!("admin:{}\n", FileAuthenticator::digest("secret")),
        )
        .expect("write credentials");

        let auth = FileAuthenticator::from_file(&auth_file).expect("credentials");
        let controller = Arc::new(
            Controller::new("/deploy", deploy_dir.path(), Box::new(auth), None)
                .expect("controller"),
        );
        let server =
            WebServer::bind(Arc::clone(&controller), "127.0.0.1:0").expect("bind server");
        let port = server.port().expect("bound port");
        let running = server.stop_flag();
        let worker = std::thread::spawn(move || server.run(2));

        Self {
            base: format!("http://127.0.0.1:{port}/deploy"),
            controller,
            running,
            worker: Some(worker),
            deploy_dir,
        }
    }

    fn deploy_path(&self) -> &Path {
        self.deploy_dir.path()
    }

    fn wait_for_terminal(&self, name: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(progress) = self.controller.supervisor().progress(name) {
                if matches!(progress.state, DeployState::Success | DeployState::Error) {
                    return;
                }
            }
            assert!(
                Instant::now() < deadline,
                "deployment {name} did not reach a terminal state"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.controller.supervisor().stop_all();
    }
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client")
}

/// Log in and return the session cookie pair.
fn login(client: &reqwest::blocking::Client, base: &str) -> String {
    let response = client
        .post(format!("{base}/login"))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body("username=admin&password=secret")
        .send()
        .expect("login request");
    assert_eq!(response.status().as_u16(), 302);

    let cookie = response
        .headers()
        .get("Set-Cookie")
        .expect("session cookie")
        .to_str()
        .expect("utf8")
        .to_string();
    cookie
        .split(';')
        .next()
        .expect("cookie pair")
        .to_string()
}

const BOUNDARY: &str = "deployd-test-boundary";

fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        write!(
            body,
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )
        .expect("write field");
    }
    for (name, filename, data) in files {
        write!(
            body,
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .expect("write file header");
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    write!(body, "--{BOUNDARY}--\r\n").expect("write closing boundary");
    body
}

fn post_form(
    client: &reqwest::blocking::Client,
    url: &str,
    cookie: &str,
    fields: &[(&str, &str)],
    files: &[(&str, &str, &[u8])],
) -> reqwest::blocking::Response {
    client
        .post(url)
        .header("Cookie", cookie)
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(multipart_body(fields, files))
        .send()
        .expect("form request")
}

/// A fake ssh-keygen that writes a predictable keypair.
fn write_fake_keygen(bin_dir: &Path) -> PathBuf {
    #[cfg(not(windows))]
    {
        use std::os::unix::fs::PermissionsExt;

        let path = bin_dir.join("ssh-keygen");
        fs::write(
            &path,
            "#!/usr/bin/env sh\nwhile [ $# -gt 1 ]; do shift; done\nkeyfile=\"$1\"\necho PRIVATE > \"$keyfile\"\necho \"ssh-rsa FAKEKEY deploy\" > \"$keyfile.pub\"\n",
        )
        .expect("write fake keygen");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(windows)]
    {
        let path = bin_dir.join("ssh-keygen.cmd");
        fs::write(
            &path,
            "@echo off\r\nfor %%a in (%*) do set KEYFILE=%%a\r\necho PRIVATE> \"%KEYFILE%\"\r\necho ssh-rsa FAKEKEY deploy> \"%KEYFILE%.pub\"\r\n",
        )
        .expect("write fake keygen");
        path
    }
}

/// A fake git whose clone takes a while, keeping a deployment task underway
/// long enough to observe it.
fn write_slow_fake_git(bin_dir: &Path) -> PathBuf {
    #[cfg(not(windows))]
    {
        use std::os::unix::fs::PermissionsExt;

        let path = bin_dir.join("git");
        fs::write(
            &path,
            r#"#!/usr/bin/env sh
case "$1" in
  clone)
    sleep 2
    mkdir -p "$5/.git"
    exit 0
    ;;
  rev-parse)
    echo abcd1234
    exit 0
    ;;
  ls-remote)
    printf 'ffff0000\trefs/heads/master\n'
    exit 0
    ;;
esac
exit 0
"#,
        )
        .expect("write fake git");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(windows)]
    {
        let path = bin_dir.join("git.cmd");
        fs::write(
            &path,
            "@echo off\r\nif \"%1\"==\"clone\" (\r\n  ping -n 3 127.0.0.1 > nul\r\n  mkdir \"%5\\.git\"\r\n  exit /b 0\r\n)\r\nif \"%1\"==\"rev-parse\" (\r\n  echo abcd1234\r\n  exit /b 0\r\n)\r\nif \"%1\"==\"ls-remote\" (\r\n  echo ffff0000	refs/heads/master\r\n  exit /b 0\r\n)\r\nexit /b 0\r\n",
        )
        .expect("write fake git");
        path
    }
}

#[test]
#[serial]
fn login_surface_guards_the_pages() {
    let server = TestServer::start();
    let client = client();

    // The index shows the login form without a session.
    let response = client
        .get(format!("{}/index", server.base))
        .send()
        .expect("index");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().expect("body");
    assert!(body.contains("Username"));
    assert!(body.contains("<title>Login - Deployment</title>"));

    // Guarded pages redirect to the login page targeting themselves.
    let response = client
        .get(format!("{}/list", server.base))
        .send()
        .expect("list");
    assert_eq!(response.status().as_u16(), 302);
    let location = response
        .headers()
        .get("Location")
        .expect("location")
        .to_str()
        .expect("utf8");
    assert!(location.contains("/deploy/index?page=list"));

    // An invalid login target is rejected.
    let response = client
        .get(format!("{}/index?page=bogus", server.base))
        .send()
        .expect("index");
    assert_eq!(response.status().as_u16(), 400);

    // Bad credentials bounce back to the login page.
    let response = client
        .post(format!("{}/login", server.base))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body("username=admin&password=wrong")
        .send()
        .expect("login");
    assert_eq!(response.status().as_u16(), 302);
    let location = response
        .headers()
        .get("Location")
        .expect("location")
        .to_str()
        .expect("utf8");
    assert!(location.contains("/deploy/index"));

    // Good credentials land on the (empty) list.
    let cookie = login(&client, &server.base);
    let response = client
        .get(format!("{}/list", server.base))
        .header("Cookie", &cookie)
        .send()
        .expect("list");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().expect("body");
    assert!(body.contains("No deployments found"));
    assert!(body.contains("admin"));

    // Logout drops the session.
    let response = client
        .get(format!("{}/logout", server.base))
        .header("Cookie", &cookie)
        .send()
        .expect("logout");
    assert_eq!(response.status().as_u16(), 302);
    let response = client
        .get(format!("{}/list", server.base))
        .header("Cookie", &cookie)
        .send()
        .expect("list");
    assert_eq!(response.status().as_u16(), 302);
}

#[test]
#[serial]
fn css_serves_strong_etag_with_conditional_get() {
    let server = TestServer::start();
    let client = client();

    let response = client
        .get(format!("{}/css", server.base))
        .send()
        .expect("css");
    assert_eq!(response.status().as_u16(), 200);
    let etag = response
        .headers()
        .get("ETag")
        .expect("etag")
        .to_str()
        .expect("utf8")
        .to_string();
    assert_eq!(etag.trim_matches('"').len(), 64);
    assert!(response.text().expect("body").contains("font-family"));

    let response = client
        .get(format!("{}/css", server.base))
        .header("If-None-Match", &etag)
        .send()
        .expect("conditional css");
    assert_eq!(response.status().as_u16(), 304);
}

#[test]
#[serial]
fn create_edit_and_deploy_round_trip() {
    let td = tempdir().expect("tempdir");
    let bin = td.path().join("bin");
    fs::create_dir_all(&bin).expect("mkdir");
    let fake_keygen = write_fake_keygen(&bin);
    let fake_git = write_slow_fake_git(&bin);

    temp_env::with_vars(
        [
            ("DEPLOYD_SSH_KEYGEN_BIN", Some(fake_keygen.as_os_str())),
            ("DEPLOYD_GIT_BIN", Some(fake_git.as_os_str())),
        ],
        || run_create_edit_and_deploy(&td),
    );
}

fn run_create_edit_and_deploy(td: &TempDir) {
    let server = TestServer::start();
    let client = client();
    let cookie = login(&client, &server.base);

    // Create a deployment with one secret file.
    let git_path = td.path().join("clone");
    let git_path_str = git_path.to_string_lossy().to_string();
    let response = post_form(
        &client,
        &format!("{}/create", server.base),
        &cookie,
        &[
            ("name", "test"),
            ("git_url", "https://gitlab.test/foo/bar"),
            ("git_path", &git_path_str),
            ("git_branch", "master"),
            ("secret_files_names", "env"),
        ],
        &[("secret_files", "env", b"host=db.test")],
    );
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().expect("body");
    assert!(body.contains("The deployment has been created"));
    assert!(body.contains("ssh-rsa FAKEKEY"));

    // The set is persisted and the deploy key exists on disk.
    let document = fs::read_to_string(server.deploy_path().join("deployment.json"))
        .expect("deployment.json");
    assert!(document.contains("\"name\":\"test\""));
    assert!(document.contains("\"env\":\"host=db.test\""));
    let key_file = server.deploy_path().join("key-test");
    assert!(key_file.exists());

    // The list shows the new deployment as outdated (no working copy).
    let response = client
        .get(format!("{}/list", server.base))
        .header("Cookie", &cookie)
        .send()
        .expect("list");
    let body = response.text().expect("body");
    assert!(body.contains("test"));
    assert!(body.contains("Outdated"));

    // A duplicate create is rejected.
    let response = post_form(
        &client,
        &format!("{}/create", server.base),
        &cookie,
        &[("name", "test")],
        &[],
    );
    assert_eq!(response.status().as_u16(), 500);
    assert!(
        response
            .text()
            .expect("body")
            .contains("Deployment 'test' already exists")
    );

    // Rename while keeping the deploy key.
    let response = post_form(
        &client,
        &format!("{}/edit", server.base),
        &cookie,
        &[
            ("name", "test2"),
            ("old_name", "test"),
            ("deploy_key", "1"),
            ("git_url", "https://gitlab.test/foo/bar"),
            ("git_path", &git_path_str),
            ("secret_files_names", "env"),
        ],
        &[],
    );
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().expect("body");
    assert!(body.contains("original deploy key"));
    assert!(key_file.exists());

    // Rename again with a fresh deploy key: the old key file goes away.
    let response = post_form(
        &client,
        &format!("{}/edit", server.base),
        &cookie,
        &[
            ("name", "test3"),
            ("old_name", "test2"),
            ("git_url", "https://gitlab.test/foo/bar"),
            ("git_path", &git_path_str),
            ("secret_files_names", "env"),
        ],
        &[],
    );
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().expect("body");
    assert!(body.contains("new deploy key"));
    assert!(!key_file.exists());
    assert!(server.deploy_path().join("key-test3").exists());

    // Editing an unknown deployment is a 404.
    let response = post_form(
        &client,
        &format!("{}/edit", server.base),
        &cookie,
        &[("name", "other"), ("old_name", "ghost")],
        &[],
    );
    assert_eq!(response.status().as_u16(), 404);

    // Start a deployment; the slow clone keeps it underway.
    let response = post_form(
        &client,
        &format!("{}/deploy", server.base),
        &cookie,
        &[("name", "test3")],
        &[],
    );
    assert_eq!(response.status().as_u16(), 200);
    assert!(
        response
            .text()
            .expect("body")
            .contains("The deployment of test3 has started")
    );

    // A second start for the same name is refused while underway.
    let response = post_form(
        &client,
        &format!("{}/deploy", server.base),
        &cookie,
        &[("name", "test3")],
        &[],
    );
    assert_eq!(response.status().as_u16(), 200);
    assert!(
        response
            .text()
            .expect("body")
            .contains("Another deployment of test3 is already underway")
    );

    // The progress view shows the live state.
    let response = client
        .get(format!("{}/deploy?name=test3", server.base))
        .header("Cookie", &cookie)
        .send()
        .expect("progress");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().expect("body");
    assert!(body.contains("state"));

    // The pipeline finishes: clone, secret write, no services, success.
    server.wait_for_terminal("test3");
    let progress = server
        .controller
        .supervisor()
        .progress("test3")
        .expect("progress");
    assert_eq!(progress.state, DeployState::Success);
    assert_eq!(
        fs::read_to_string(git_path.join("env")).expect("secret file"),
        "host=db.test"
    );

    // Deploying an unknown name is a 404; observing a deployment that has
    // no progress record redirects to the list.
    let response = post_form(
        &client,
        &format!("{}/deploy", server.base),
        &cookie,
        &[("name", "ghost")],
        &[],
    );
    assert_eq!(response.status().as_u16(), 404);
}

#[test]
#[serial]
fn edit_form_requires_name_and_existing_deployment() {
    let server = TestServer::start();
    let client = client();
    let cookie = login(&client, &server.base);

    // No name: back to the list.
    let response = client
        .get(format!("{}/edit", server.base))
        .header("Cookie", &cookie)
        .send()
        .expect("edit");
    assert_eq!(response.status().as_u16(), 302);

    // Unknown name: 404.
    let response = client
        .get(format!("{}/edit?name=ghost", server.base))
        .header("Cookie", &cookie)
        .send()
        .expect("edit");
    assert_eq!(response.status().as_u16(), 404);
}
