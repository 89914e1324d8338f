//! Well-known mail submission services.
//!
//! [`lookup`] accepts a service name (`"Gmail"`), an alias (`"Google Mail"`)
//! or a mailbox domain (`"googlemail.com"`), case-insensitively.

/// Submission endpoint of a known provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    /// Display name.
    pub name: &'static str,
    /// Alternative names.
    pub aliases: &'static [&'static str],
    /// Mailbox domains served by this provider.
    pub domains: &'static [&'static str],
    /// Submission host.
    pub host: &'static str,
    /// Submission port.
    pub port: u16,
    /// Implicit TLS on `port`.
    pub secure: bool,
}

/// Known services.
pub static SERVICES: &[Service] = &[
    Service {
        name: "Gmail",
        aliases: &["Google Mail"],
        domains: &["gmail.com", "googlemail.com"],
        host: "smtp.gmail.com",
        port: 465,
        secure: true,
    },
    Service {
        name: "Outlook365",
        aliases: &["Office365", "Microsoft365"],
        domains: &[],
        host: "smtp.office365.com",
        port: 587,
        secure: false,
    },
    Service {
        name: "Hotmail",
        aliases: &["Outlook", "Outlook.com", "Live"],
        domains: &["hotmail.com", "outlook.com", "live.com", "msn.com"],
        host: "smtp-mail.outlook.com",
        port: 587,
        secure: false,
    },
    Service {
        name: "Yahoo",
        aliases: &["Yahoo Mail"],
        domains: &["yahoo.com", "ymail.com", "rocketmail.com"],
        host: "smtp.mail.yahoo.com",
        port: 465,
        secure: true,
    },
    Service {
        name: "iCloud",
        aliases: &["Me", "Mac"],
        domains: &["icloud.com", "me.com", "mac.com"],
        host: "smtp.mail.me.com",
        port: 587,
        secure: false,
    },
    Service {
        name: "AOL",
        aliases: &["AOL Mail"],
        domains: &["aol.com"],
        host: "smtp.aol.com",
        port: 587,
        secure: false,
    },
    Service {
        name: "Zoho",
        aliases: &["Zoho Mail"],
        domains: &["zoho.com", "zohomail.com"],
        host: "smtp.zoho.com",
        port: 465,
        secure: true,
    },
    Service {
        name: "FastMail",
        aliases: &[],
        domains: &["fastmail.com", "fastmail.fm"],
        host: "smtp.fastmail.com",
        port: 465,
        secure: true,
    },
    Service {
        name: "GMX",
        aliases: &[],
        domains: &["gmx.com", "gmx.net", "gmx.de"],
        host: "mail.gmx.com",
        port: 587,
        secure: false,
    },
    Service {
        name: "Yandex",
        aliases: &[],
        domains: &["yandex.ru", "yandex.com"],
        host: "smtp.yandex.ru",
        port: 465,
        secure: true,
    },
    Service {
        name: "Proton",
        aliases: &["ProtonMail"],
        domains: &["proton.me", "protonmail.com"],
        host: "smtp.protonmail.ch",
        port: 587,
        secure: false,
    },
    Service {
        name: "Mailgun",
        aliases: &[],
        domains: &[],
        host: "smtp.mailgun.org",
        port: 465,
        secure: true,
    },
    Service {
        name: "SendGrid",
        aliases: &[],
        domains: &[],
        host: "smtp.sendgrid.net",
        port: 587,
        secure: false,
    },
    Service {
        name: "Postmark",
        aliases: &["PostmarkApp"],
        domains: &[],
        host: "smtp.postmarkapp.com",
        port: 2525,
        secure: false,
    },
    Service {
        name: "SES",
        aliases: &["Amazon SES", "SES-US-EAST-1"],
        domains: &[],
        host: "email-smtp.us-east-1.amazonaws.com",
        port: 465,
        secure: true,
    },
    Service {
        name: "Mailjet",
        aliases: &[],
        domains: &[],
        host: "in-v3.mailjet.com",
        port: 587,
        secure: false,
    },
    Service {
        name: "Brevo",
        aliases: &["Sendinblue"],
        domains: &[],
        host: "smtp-relay.brevo.com",
        port: 587,
        secure: false,
    },
];

/// Finds a service by name, alias or mailbox domain.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static Service> {
    let key = normalize(name);
    if key.is_empty() {
        return None;
    }
    SERVICES.iter().find(|service| {
        normalize(service.name) == key
            || service.aliases.iter().any(|alias| normalize(alias) == key)
            || service.domains.iter().any(|domain| *domain == key)
    })
}

/// Lowercases and drops everything but letters, digits, `.` and `-`.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn by_name_alias_and_domain() {
        assert_eq!(lookup("Gmail").unwrap().host, "smtp.gmail.com");
        assert_eq!(lookup("google mail").unwrap().name, "Gmail");
        assert_eq!(lookup("GoogleMail.com").unwrap().name, "Gmail");
        assert_eq!(lookup("sendinblue").unwrap().name, "Brevo");
        assert_eq!(lookup("Amazon SES").unwrap().port, 465);
    }

    #[test]
    fn unknown_service() {
        assert!(lookup("example.com").is_none());
        assert!(lookup("").is_none());
        assert!(lookup("  ").is_none());
    }

    #[test]
    fn table_is_consistent() {
        for service in SERVICES {
            assert_eq!(lookup(service.name).unwrap().name, service.name);
            assert!(service.port > 0);
            for domain in service.domains {
                assert_eq!(normalize(domain), *domain);
            }
        }
    }
}
