use super::field::Parameter;
use crate::{Error, Result};
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host plus optional port. The host may be a name, an IPv4 literal or a
/// bracketed IPv6 literal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }

    /// Split `host[:port]`, keeping IPv6 brackets intact.
    pub fn parse(text: &str) -> Result<HostPort> {
        if text.is_empty() {
            return Err(Error::MessageError("empty host".to_string()));
        }
        if let Some(end) = text.strip_prefix('[').and_then(|rest| rest.find(']')) {
            let host = &text[..end + 2];
            let rest = &text[end + 2..];
            let port = match rest.strip_prefix(':') {
                Some(port) => Some(port.parse()?),
                None if rest.is_empty() => None,
                None => return Err(Error::MessageError(format!("bad host-port: {}", text))),
            };
            return Ok(HostPort::new(host, port));
        }
        match text.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(HostPort::new(host, Some(port.parse()?))),
            _ => Ok(HostPort::new(text, None)),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    pub fn socket_addr(&self, default_port: u16) -> Option<SocketAddr> {
        self.ip()
            .map(|ip| SocketAddr::new(ip, self.port.unwrap_or(default_port)))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        };
        HostPort::new(host, Some(addr.port()))
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// SIP URI per RFC 3261 section 19.1, limited to the sip/sips schemes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host_port: HostPort,
    pub params: Vec<Parameter>,
    pub headers: Vec<(String, String)>,
}

impl Uri {
    pub fn new(user: Option<&str>, host_port: HostPort) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: user.map(|u| u.to_string()),
            password: None,
            host_port,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Uri> {
        let (scheme, rest) = if let Some(rest) = text.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else if let Some(rest) = text.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else {
            return Err(Error::MessageError(format!("unsupported URI scheme: {}", text)));
        };

        let (userinfo, rest) = match rest.split_once('@') {
            Some((userinfo, rest)) => (Some(userinfo), rest),
            None => (None, rest),
        };
        let (user, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(userinfo.to_string()), None),
            },
            None => (None, None),
        };

        let (rest, headers_text) = match rest.split_once('?') {
            Some((rest, headers)) => (rest, Some(headers)),
            None => (rest, None),
        };

        let mut param_parts = rest.split(';');
        let host_port = HostPort::parse(
            param_parts
                .next()
                .ok_or_else(|| Error::MessageError("URI missing host".to_string()))?,
        )?;

        let mut params = Vec::new();
        for part in param_parts {
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => params.push(Parameter::with_value(name, value)),
                None => params.push(Parameter::flag(part)),
            }
        }

        let mut headers = Vec::new();
        if let Some(headers_text) = headers_text {
            for part in headers_text.split('&') {
                match part.split_once('=') {
                    Some((name, value)) => headers.push((name.to_string(), value.to_string())),
                    None if !part.is_empty() => headers.push((part.to_string(), String::new())),
                    None => {}
                }
            }
        }

        Ok(Uri {
            scheme,
            user,
            password,
            host_port,
            params,
            headers,
        })
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        self.params.retain(|p| !p.name.eq_ignore_ascii_case(name));
        self.params.push(Parameter {
            name: name.to_string(),
            value: value.map(|v| v.to_string()),
        });
    }

    /// Every outgoing request URI carries `transport=tcp`; add it if absent.
    pub fn ensure_tcp_transport(&mut self) {
        if self.param("transport").is_none() {
            self.set_param("transport", Some("tcp"));
        }
    }

    /// The address-of-record form: scheme, user and host only.
    pub fn aor(&self) -> Uri {
        Uri {
            scheme: self.scheme,
            user: self.user.clone(),
            password: None,
            host_port: HostPort::new(self.host_port.host.clone(), None),
            params: Vec::new(),
            headers: Vec::new(),
        }
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            f.write_str(user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}", self.host_port)?;
        for param in &self.params {
            match &param.value {
                Some(value) => write!(f, ";{}={}", param.name, value)?,
                None => write!(f, ";{}", param.name)?,
            }
        }
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uri::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri = Uri::parse("sip:alice:secret@example.test:5070;transport=tcp?subject=call")
            .expect("valid uri");
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.host_port.host, "example.test");
        assert_eq!(uri.host_port.port, Some(5070));
        assert_eq!(uri.param("transport").unwrap().value.as_deref(), Some("tcp"));
        assert_eq!(uri.headers[0], ("subject".to_string(), "call".to_string()));
    }

    #[test]
    fn test_roundtrip() {
        for text in [
            "sip:example.test",
            "sip:bob@example.test",
            "sips:bob@example.test:5061",
            "sip:bob@192.0.2.5:5060;transport=tcp",
            "sip:bob@[2001:db8::1]:5060",
        ] {
            let uri = Uri::parse(text).expect("valid uri");
            assert_eq!(uri.to_string(), text);
        }
    }

    #[test]
    fn test_ensure_tcp_transport() {
        let mut uri = Uri::parse("sip:bob@example.test").unwrap();
        uri.ensure_tcp_transport();
        uri.ensure_tcp_transport();
        assert_eq!(uri.to_string(), "sip:bob@example.test;transport=tcp");
    }

    #[test]
    fn test_bad_scheme_rejected() {
        assert!(Uri::parse("http://example.test").is_err());
    }
}
