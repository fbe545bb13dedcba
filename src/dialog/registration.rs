use super::authenticate::{handle_client_authenticate, Credential};
use crate::message::header::{CSeq, ContactInfo, FromTo, NameAddr};
use crate::message::uri::HostPort;
use crate::message::{Method, Request, Response, SipMessage, StatusCode, StatusKind, Uri};
use crate::transaction::endpoint::Endpoint;
use crate::transaction::{make_branch, make_call_id, make_tag};
use crate::transport::connection::push_via;
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Refresh runs this many seconds before the binding expires.
const REFRESH_MARGIN: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Inactive,
    FirstRegistration,
    Deregistering,
    ReRegistering,
    Active,
}

/// Client-side registrar binding with NAT rebinding detection: when the
/// first 200 OK reveals a different `received`/`rport` than our Contact,
/// the stale binding is removed with `Expires: 0` and re-registered with
/// the reflexive address. Later refreshes only adopt address changes.
pub struct Registration {
    endpoint: Arc<Endpoint>,
    credential: Option<Credential>,
    username: String,
    server: String,
    pub status: RegistrationStatus,
    pub contact: Uri,
    expires: u32,
    last_seq: u32,
    call_id: String,
    from_tag: String,
    connection: Option<SipConnection>,
}

impl Registration {
    pub fn new(
        endpoint: Arc<Endpoint>,
        username: impl Into<String>,
        server: impl Into<String>,
        credential: Option<Credential>,
        contact: Uri,
        expires: u32,
    ) -> Self {
        let server = server.into();
        Registration {
            endpoint,
            credential,
            username: username.into(),
            call_id: make_call_id(Some(&server)),
            server,
            status: RegistrationStatus::Inactive,
            contact,
            expires,
            last_seq: 0,
            from_tag: make_tag(),
            connection: None,
        }
    }

    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.expires.saturating_sub(REFRESH_MARGIN) as u64)
    }

    fn address_of_record(&self) -> Uri {
        let host_port = HostPort::parse(&self.server)
            .unwrap_or_else(|_| HostPort::new(self.server.clone(), None));
        let mut uri = Uri::new(Some(&self.username), host_port);
        uri.ensure_tcp_transport();
        uri
    }

    async fn connection(&mut self) -> Result<SipConnection> {
        if let Some(connection) = &self.connection {
            return Ok(connection.clone());
        }
        let target = SipAddr::resolve(&self.address_of_record()).await?;
        let connection = self
            .endpoint
            .transport_layer()
            .lookup(&target, self.endpoint.transport_sender())
            .await?;
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    fn make_register(&mut self, expires: u32, local: &SipAddr) -> Request {
        self.last_seq += 1;
        let aor = self.address_of_record();
        let mut request = Request::new(Method::Register, {
            let mut uri = aor.clone();
            uri.user = None;
            uri
        });
        push_via(&mut request, local, make_branch());
        request.header.max_forwards = Some(70);
        request.header.from =
            Some(FromTo::new(NameAddr::from_uri(aor.aor())).with_tag(self.from_tag.clone()));
        request.header.to = Some(FromTo::new(NameAddr::from_uri(aor.aor())));
        request.header.call_id = Some(self.call_id.clone());
        request.header.cseq = Some(CSeq::new(self.last_seq, Method::Register));
        request.header.contact = vec![ContactInfo::from_uri(self.contact.clone())];
        request.header.expires = Some(expires);
        request.header.user_agent = Some(self.endpoint.user_agent().to_string());
        request
    }

    /// Sends one REGISTER and waits for its final response, answering a
    /// single digest challenge on the way.
    async fn send_register(&mut self, expires: u32) -> Result<Response> {
        let connection = self.connection().await?;
        let request = self.make_register(expires, connection.get_addr());
        let mut tx = self
            .endpoint
            .client_transaction_on(request, connection)?;
        tx.send().await?;
        let mut auth_sent = false;

        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                _ => break,
            };
            match resp.status {
                StatusCode::TRYING => continue,
                StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                    if auth_sent {
                        info!("registration challenged again after credentials, giving up");
                        return Ok(resp);
                    }
                    match &self.credential {
                        Some(credential) => {
                            self.last_seq += 1;
                            tx = handle_client_authenticate(self.last_seq, tx, resp, credential)
                                .await?;
                            tx.send().await?;
                            auth_sent = true;
                        }
                        None => {
                            info!("registration challenged but no credentials configured");
                            return Ok(resp);
                        }
                    }
                }
                _ => return Ok(resp),
            }
        }
        Err(Error::RegistrationError(
            "registration transaction terminated without a final response".to_string(),
        ))
    }

    /// The reflexive address the registrar saw, when it differs from our
    /// Contact.
    fn reflexive_mismatch(&self, response: &Response) -> Option<(String, u16)> {
        let (received, rport) = response.header.top_via()?.reflexive_addr()?;
        let contact_host = &self.contact.host_port.host;
        let contact_port = self
            .contact
            .host_port
            .port
            .unwrap_or(crate::config::DEFAULT_SIP_PORT);
        if *contact_host != received || contact_port != rport {
            Some((received, rport))
        } else {
            None
        }
    }

    fn adopt_contact(&mut self, host: String, port: u16) {
        self.contact.host_port = HostPort::new(host, Some(port));
    }

    /// Registers with the configured registrar, running the deregister /
    /// re-register dance when the first 200 shows we are behind a NAT.
    pub async fn bind(&mut self) -> Result<()> {
        self.status = RegistrationStatus::FirstRegistration;
        let response = self.send_register(self.expires).await?;
        if response.status.kind() != StatusKind::Successful {
            self.status = RegistrationStatus::Inactive;
            return Err(Error::RegistrationError(format!(
                "REGISTER rejected: {} {}",
                response.status, response.reason
            )));
        }

        if let Some((host, port)) = self.reflexive_mismatch(&response) {
            info!("behind NAT, registrar saw us at {}:{}", host, port);

            // drop the stale binding before registering the visible one
            self.status = RegistrationStatus::Deregistering;
            let response = self.send_register(0).await?;
            if response.status.kind() != StatusKind::Successful {
                self.status = RegistrationStatus::Inactive;
                return Err(Error::RegistrationError(
                    "deregistration of stale binding failed".to_string(),
                ));
            }

            self.adopt_contact(host, port);
            self.status = RegistrationStatus::ReRegistering;
            let response = self.send_register(self.expires).await?;
            if response.status.kind() != StatusKind::Successful {
                self.status = RegistrationStatus::Inactive;
                return Err(Error::RegistrationError(
                    "NAT re-registration failed".to_string(),
                ));
            }
        }

        self.status = RegistrationStatus::Active;
        info!("registration active, refresh in {:?}", self.refresh_interval());
        Ok(())
    }

    /// Periodic refresh. A changed reflexive address at this point does
    /// not restart the deregistration dance; the new address is adopted
    /// as Contact and refreshing continues.
    pub async fn refresh(&mut self) -> Result<()> {
        if self.status != RegistrationStatus::Active {
            return Err(Error::RegistrationError(
                "refresh without an active registration".to_string(),
            ));
        }
        let response = self.send_register(self.expires).await?;
        if response.status.kind() != StatusKind::Successful {
            self.status = RegistrationStatus::Inactive;
            return Err(Error::RegistrationError(format!(
                "refresh rejected: {}",
                response.status
            )));
        }
        if let Some((host, port)) = self.reflexive_mismatch(&response) {
            warn!("NAT binding changed, now seen at {}:{}", host, port);
            self.adopt_contact(host, port);
        }
        Ok(())
    }

    /// Binds and keeps the registration refreshed until cancelled; the
    /// shutdown path deregisters with `Expires: 0`.
    pub async fn serve(&mut self, cancel_token: CancellationToken) -> Result<()> {
        self.bind().await?;
        loop {
            select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(self.refresh_interval()) => {
                    if let Err(e) = self.refresh().await {
                        warn!("registration refresh failed: {}", e);
                        return Err(e);
                    }
                }
            }
        }
        if self.status == RegistrationStatus::Active {
            self.status = RegistrationStatus::Deregistering;
            self.send_register(0).await.ok();
            self.status = RegistrationStatus::Inactive;
        }
        Ok(())
    }
}
