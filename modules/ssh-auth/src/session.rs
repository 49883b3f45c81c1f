use crate::{classify, exec_confirms, AttemptError, AuthOptions, Authenticator, ExecOutput};
use async_trait::async_trait;
use audit_core::{split_hostport, Credential, Finding};
use credentials::{secret_kind, SecretKind};
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Keyboard-interactive exchanges beyond this are treated as a rejection.
const MAX_PROMPT_ROUNDS: usize = 4;

/// Accepts every host key, optionally reporting the first one seen.
#[derive(Default)]
struct AcceptAnyKey {
    key_tx: Option<oneshot::Sender<String>>,
}

impl client::Handler for AcceptAnyKey {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        if let Some(tx) = self.key_tx.take() {
            let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
            let _ = tx.send(fingerprint.to_string());
        }
        async { Ok(true) }
    }
}

fn client_config(opts: &AuthOptions) -> Arc<client::Config> {
    let mut config = client::Config::default();
    config.inactivity_timeout = Some(opts.session_deadline());
    Arc::new(config)
}

async fn connect_tcp(hostport: &str, opts: &AuthOptions) -> Result<TcpStream, AttemptError> {
    timeout(opts.connect_timeout, TcpStream::connect(hostport))
        .await
        .map_err(|_| AttemptError::Timeout(opts.connect_timeout))?
        .map_err(|source| AttemptError::Connect { hostport: hostport.to_string(), source })
}

async fn hang_up(handle: &Handle<AcceptAnyKey>) {
    let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
}

/// The earlier of `deadline` and `step` from now.
fn step_deadline(deadline: Instant, step: Duration) -> Instant {
    deadline.min(Instant::now() + step)
}

/// Signature hash to use with an RSA key.
///
/// `advertised` is what `best_supported_rsa_hash` reported. A server without
/// `server-sig-algs` gets SHA-256; one that lists only `ssh-rsa` gets SHA-1.
fn rsa_hash(advertised: Option<Option<HashAlg>>) -> Option<HashAlg> {
    match advertised {
        Some(alg) => alg,
        None => Some(HashAlg::Sha256),
    }
}

/// Capture the host key of `hostport` by logging in with the probe credential.
///
/// Returns an empty string if the handshake never got as far as the key.
pub async fn fetch_fingerprint(hostport: &str, opts: &AuthOptions) -> String {
    let (key_tx, mut key_rx) = oneshot::channel();
    let deadline = opts.session_deadline();
    let probe = async {
        let tcp = connect_tcp(hostport, opts).await?;
        let handshake = async {
            let handler = AcceptAnyKey { key_tx: Some(key_tx) };
            let mut handle = client::connect_stream(client_config(opts), tcp, handler).await?;
            let res = handle.authenticate_password(&opts.probe_user, &opts.probe_password).await?;
            if matches!(res, AuthResult::Success) {
                warn!(host = hostport, user = %opts.probe_user, "probe credential was accepted");
            }
            hang_up(&handle).await;
            Ok::<_, AttemptError>(())
        };
        timeout(deadline, handshake).await.map_err(|_| AttemptError::Timeout(deadline))?
    };
    if let Err(e) = probe.await {
        debug!(host = hostport, error = %e, "fingerprint probe ended early");
    }
    key_rx.try_recv().unwrap_or_default()
}

/// [`Authenticator`] speaking real SSH.
pub struct SshAuthenticator {
    opts: AuthOptions,
    config: Arc<client::Config>,
}

impl SshAuthenticator {
    pub fn new(opts: AuthOptions) -> Self {
        let config = client_config(&opts);
        SshAuthenticator { opts, config }
    }

    /// Handshake and authenticate. The handle is returned either way so the
    /// caller can hang up.
    async fn login(
        &self,
        tcp: TcpStream,
        hostport: &str,
        cred: &Credential,
        key: Option<PrivateKey>,
    ) -> Result<(Handle<AcceptAnyKey>, bool), AttemptError> {
        let mut handle = client::connect_stream(self.config.clone(), tcp, AcceptAnyKey::default()).await?;
        let authenticated = match key {
            Some(key) => {
                let hash_alg = if key.algorithm().is_rsa() {
                    rsa_hash(handle.best_supported_rsa_hash().await?)
                } else {
                    None
                };
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
                matches!(handle.authenticate_publickey(&cred.user, key).await?, AuthResult::Success)
            }
            None => password_or_interactive(&mut handle, hostport, &cred.user, &cred.password).await?,
        };
        Ok((handle, authenticated))
    }

    /// Grade a login that already worked. Anything that stalls or fails
    /// here leaves that capability unconfirmed.
    async fn verify(&self, handle: &Handle<AcceptAnyKey>, hostport: &str, user: &str, deadline: Instant) -> Finding {
        let exec_deadline = step_deadline(deadline, self.opts.connect_timeout);
        let exec = match timeout_at(exec_deadline, run_command(handle, &self.opts.exec_command)).await {
            Ok(Ok(out)) => Some(out),
            Ok(Err(e)) => {
                debug!(host = hostport, user, error = %e, "login worked but exec failed");
                None
            }
            Err(_) => {
                debug!(host = hostport, user, "exec did not finish in time");
                None
            }
        };
        let exec_ok = exec_confirms(exec.as_ref(), &self.opts.false_positives);
        if !exec_ok {
            if let Some(out) = &exec {
                debug!(host = hostport, user, status = ?out.exit_status, output = %out.output.trim(), "exec not confirmed");
            }
        }
        let tunnel_ok = !exec_ok && open_tunnel(handle, hostport, deadline).await;
        classify(true, exec_ok, tunnel_ok)
    }
}

#[async_trait]
impl Authenticator for SshAuthenticator {
    async fn attempt(&self, hostport: &str, cred: &Credential) -> Result<Finding, AttemptError> {
        let key = match secret_kind(&cred.password) {
            SecretKind::PrivateKey => Some(
                russh::keys::decode_secret_key(&cred.password, None).map_err(|e| AttemptError::Key(e.to_string()))?,
            ),
            SecretKind::Password => None,
        };
        let tcp = connect_tcp(hostport, &self.opts).await?;
        let budget = self.opts.session_deadline();
        let deadline = Instant::now() + budget;
        let (handle, authenticated) = timeout_at(deadline, self.login(tcp, hostport, cred, key))
            .await
            .map_err(|_| AttemptError::Timeout(budget))??;
        let finding = if authenticated {
            self.verify(&handle, hostport, &cred.user, deadline).await
        } else {
            Finding::None
        };
        hang_up(&handle).await;
        Ok(finding)
    }
}

/// Password auth, then keyboard-interactive answering every prompt with the password.
async fn password_or_interactive(
    handle: &mut Handle<AcceptAnyKey>,
    hostport: &str,
    user: &str,
    password: &str,
) -> Result<bool, AttemptError> {
    if matches!(handle.authenticate_password(user, password).await?, AuthResult::Success) {
        return Ok(true);
    }

    // The server already answered once, so a failure from here on is a rejection.
    let mut resp = match handle.authenticate_keyboard_interactive_start(user, None::<String>).await {
        Ok(r) => r,
        Err(e) => {
            debug!(host = hostport, user, error = %e, "keyboard-interactive unavailable");
            return Ok(false);
        }
    };
    for _ in 0..MAX_PROMPT_ROUNDS {
        match resp {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers = vec![password.to_string(); prompts.len()];
                resp = match handle.authenticate_keyboard_interactive_respond(answers).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(host = hostport, user, error = %e, "keyboard-interactive aborted");
                        return Ok(false);
                    }
                };
            }
            _ => return Ok(false),
        }
    }
    Ok(false)
}

async fn run_command(handle: &Handle<AcceptAnyKey>, command: &str) -> Result<ExecOutput, russh::Error> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut out = ExecOutput::default();
    let mut combined = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => combined.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => combined.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => out.exit_status = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    out.output = String::from_utf8_lossy(&combined).into_owned();
    Ok(out)
}

/// Try a direct-tcpip channel to the target itself, then to its loopback.
async fn open_tunnel(handle: &Handle<AcceptAnyKey>, hostport: &str, deadline: Instant) -> bool {
    let Some((host, port)) = split_hostport(hostport) else { return false };
    for dest in [host.as_str(), "127.0.0.1"] {
        match timeout_at(deadline, handle.channel_open_direct_tcpip(dest, u32::from(port), "127.0.0.1", 0)).await {
            Ok(Ok(channel)) => {
                drop(channel);
                return true;
            }
            Ok(Err(e)) => debug!(host = hostport, dest, error = %e, "direct-tcpip refused"),
            Err(_) => {
                debug!(host = hostport, dest, "direct-tcpip did not answer in time");
                return false;
            }
        }
    }
    false
}
