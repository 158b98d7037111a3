//! SIP message builders
//!
//! `DialogFactory` is the only place that knows what headers go into a
//! request; the call state machine asks it for REGISTER/INVITE/ACK/CANCEL
//! and never touches wire syntax itself.

use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use crate::domain::shared::SipUri;
use rsip::{Header, Headers, Request, Response, StatusCode, Version};
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

pub const ALLOW_METHODS: &str = "INVITE, ACK, BYE, CANCEL, UPDATE, INFO, NOTIFY, OPTIONS";

const MAX_FORWARDS: &str = "70";
const BRANCH_MAGIC: &str = "z9hG4bK";

/// Build a simple SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(mut self, request: &SipRequest) -> Result<SipResponse, SipError> {
        if request.call_id().is_none() || request.cseq().is_none() {
            return Err(SipError::InvalidMessage(format!(
                "{} without Call-ID or CSeq cannot be answered",
                request.inner.method
            )));
        }

        // Copy essential headers from request
        let mut headers: Vec<Header> = request
            .headers()
            .iter()
            .filter(|header| {
                matches!(
                    header,
                    Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_)
                )
            })
            .cloned()
            .collect();
        headers.append(&mut self.headers);

        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Credentials header to attach to a resubmitted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Answer to `WWW-Authenticate`
    Authorization(String),
    /// Answer to `Proxy-Authenticate`
    ProxyAuthorization(String),
}

fn to_rsip_uri(uri: &SipUri) -> rsip::Uri {
    let host = match uri.host().parse::<IpAddr>() {
        Ok(ip) => rsip::Host::IpAddr(ip),
        Err(_) => rsip::Host::Domain(uri.host().into()),
    };

    rsip::Uri {
        scheme: Some(rsip::Scheme::Sip),
        auth: uri.user().map(|user| rsip::Auth {
            user: user.to_string(),
            password: None,
        }),
        host_with_port: rsip::HostWithPort {
            host,
            port: uri.port().map(Into::into),
        },
        params: vec![],
        headers: vec![],
    }
}

fn first_header(request: &SipRequest, wanted: fn(&Header) -> bool) -> Option<Header> {
    request.headers().iter().find(|header| wanted(header)).cloned()
}

fn new_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, Uuid::new_v4().simple())
}

fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

/// Builds requests for one local user agent talking to one registrar
#[derive(Debug, Clone)]
pub struct DialogFactory {
    user: String,
    registrar: SipUri,
    local: SocketAddr,
    user_agent: String,
    expires: u32,
}

impl DialogFactory {
    pub fn new(user: &str, registrar: SipUri, local: SocketAddr) -> Self {
        Self {
            user: user.to_string(),
            registrar,
            local,
            user_agent: concat!("gatecall/", env!("CARGO_PKG_VERSION")).to_string(),
            expires: 300,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    pub fn registrar(&self) -> &SipUri {
        &self.registrar
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// `sip:<number>@<registrar>`
    pub fn target(&self, number: &str) -> SipUri {
        let uri = SipUri::at(number, self.registrar.host());
        match self.registrar.port() {
            Some(port) => uri.with_port(port),
            None => uri,
        }
    }

    fn via(&self, branch: &str) -> Header {
        Header::Via(format!("SIP/2.0/UDP {};rport;branch={}", self.local, branch).into())
    }

    fn contact(&self) -> Header {
        let host = match self.local.ip() {
            IpAddr::V6(ip) => format!("[{}]", ip),
            IpAddr::V4(ip) => ip.to_string(),
        };
        Header::Contact(format!("<sip:{}@{}:{};ob>", self.user, host, self.local.port()).into())
    }

    /// Fresh request on a new Call-ID
    pub fn new_request(
        &self,
        method: SipMethod,
        target: &SipUri,
        to: &SipUri,
        cseq: u32,
        body: Vec<u8>,
    ) -> SipRequest {
        let from = SipUri::at(&self.user, self.registrar.host());
        let call_id = format!("{}@{}", Uuid::new_v4().simple(), self.local.ip());

        let mut headers = vec![
            self.via(&new_branch()),
            Header::MaxForwards(MAX_FORWARDS.into()),
            Header::From(format!("<{}>;tag={}", from, new_tag()).into()),
            Header::To(format!("<{}>", to).into()),
            Header::CallId(call_id.into()),
            Header::CSeq(format!("{} {}", cseq, method).into()),
            self.contact(),
            Header::UserAgent(self.user_agent.clone().into()),
            Header::Allow(ALLOW_METHODS.into()),
        ];
        if method == SipMethod::Register {
            headers.push(Header::Expires(self.expires.to_string().into()));
        }
        if !body.is_empty() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        headers.push(Header::ContentLength(body.len().to_string().into()));

        SipRequest::new(Request {
            method: method.to_rsip(),
            uri: to_rsip_uri(target),
            version: Version::V2,
            headers: Headers::from(headers),
            body,
        })
    }

    /// REGISTER for our own address of record
    pub fn new_register(&self, cseq: u32) -> SipRequest {
        let aor = SipUri::at(&self.user, self.registrar.host());
        self.new_request(SipMethod::Register, &self.registrar, &aor, cseq, Vec::new())
    }

    /// INVITE towards `number` with a minimal audio offer
    pub fn new_invite(&self, number: &str, cseq: u32, rtp_port: u16) -> SipRequest {
        let target = self.target(number);
        let to = SipUri::at(number, self.registrar.host());
        self.new_request(
            SipMethod::Invite,
            &target,
            &to,
            cseq,
            sdp_offer(self.local.ip(), rtp_port),
        )
    }

    /// Same request as a new transaction: new branch, new CSeq, and the
    /// given credentials replacing any previous ones.
    pub fn resubmit(
        &self,
        request: &SipRequest,
        cseq: u32,
        credentials: Option<Credentials>,
    ) -> SipRequest {
        let method = request.inner.method.clone();
        let mut headers = vec![self.via(&new_branch())];
        headers.extend(
            request
                .headers()
                .iter()
                .filter(|header| {
                    !matches!(
                        header,
                        Header::Via(_)
                            | Header::CSeq(_)
                            | Header::Authorization(_)
                            | Header::ProxyAuthorization(_)
                            | Header::ContentLength(_)
                    )
                })
                .cloned(),
        );
        headers.push(Header::CSeq(format!("{} {}", cseq, method).into()));
        match credentials {
            Some(Credentials::Authorization(value)) => {
                headers.push(Header::Authorization(value.into()))
            }
            Some(Credentials::ProxyAuthorization(value)) => {
                headers.push(Header::ProxyAuthorization(value.into()))
            }
            None => {}
        }
        headers.push(Header::ContentLength(request.body().len().to_string().into()));

        SipRequest::new(Request {
            method,
            uri: request.uri().clone(),
            version: Version::V2,
            headers: Headers::from(headers),
            body: request.body().to_vec(),
        })
    }

    /// Hop-by-hop request sharing the INVITE's transaction identity
    fn in_transaction(&self, invite: &SipRequest, method: SipMethod, to: Option<Header>) -> SipRequest {
        let cseq = invite.cseq().unwrap_or_default();

        let mut headers = Vec::new();
        headers.extend(first_header(invite, |h| matches!(h, Header::Via(_))));
        headers.push(Header::MaxForwards(MAX_FORWARDS.into()));
        headers.extend(first_header(invite, |h| matches!(h, Header::From(_))));
        headers.extend(to.or_else(|| first_header(invite, |h| matches!(h, Header::To(_)))));
        headers.extend(first_header(invite, |h| matches!(h, Header::CallId(_))));
        headers.push(Header::CSeq(format!("{} {}", cseq, method).into()));
        headers.push(Header::UserAgent(self.user_agent.clone().into()));
        headers.push(Header::ContentLength("0".into()));

        SipRequest::new(Request {
            method: method.to_rsip(),
            uri: invite.uri().clone(),
            version: Version::V2,
            headers: Headers::from(headers),
            body: Vec::new(),
        })
    }

    /// ACK for a final response to `invite`; the To header (and its tag)
    /// comes from the response.
    pub fn new_ack(&self, response: &SipResponse, invite: &SipRequest) -> SipRequest {
        let to = response
            .headers()
            .iter()
            .find(|header| matches!(header, Header::To(_)))
            .cloned();
        self.in_transaction(invite, SipMethod::Ack, to)
    }

    /// CANCEL for a pending `invite`
    pub fn new_cancel(&self, invite: &SipRequest) -> SipRequest {
        self.in_transaction(invite, SipMethod::Cancel, None)
    }

    /// Response to an inbound request
    pub fn new_response(&self, request: &SipRequest, status: u16) -> Result<SipResponse, SipError> {
        ResponseBuilder::new(status)
            .header(Header::UserAgent(self.user_agent.clone().into()))
            .build_for_request(request)
    }
}

/// Minimal SDP offer: PCMU plus DTMF events
pub fn sdp_offer(ip: IpAddr, rtp_port: u16) -> Vec<u8> {
    let family = if ip.is_ipv6() { "IP6" } else { "IP4" };
    let session = Uuid::new_v4().as_u128() as u32;
    format!(
        "v=0\r\n\
         o=gatecall {session} {session} IN {family} {ip}\r\n\
         s=gatecall\r\n\
         c=IN {family} {ip}\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP 0 101\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=fmtp:101 0-16\r\n\
         a=sendrecv\r\n"
    )
    .into_bytes()
}
