use std::time::Duration;

use chclient::{Client, Credentials, DEFAULT_ADDR};
use clap::Parser;
use secrecy::{ExposeSecret, Secret};

#[derive(Debug, Parser)]
pub(crate) struct ClickHouseConfig {
    /// The `host:port` of the ClickHouse HTTP interface
    #[clap(
        short = 'a',
        long = "addr",
        env = "CLICKHOUSE_ADDR",
        default_value = DEFAULT_ADDR
    )]
    pub(crate) addr: String,

    /// Address tried once when the primary address cannot be reached
    #[clap(long = "fallback-addr", env = "CLICKHOUSE_FALLBACK_ADDR")]
    pub(crate) fallback_addr: Option<String>,

    /// The user to run queries as
    #[clap(
        short = 'u',
        long = "user",
        env = "CLICKHOUSE_USER",
        default_value = chclient::DEFAULT_USER
    )]
    pub(crate) user: String,

    /// The password of `user`
    #[clap(long = "password", env = "CLICKHOUSE_PASSWORD")]
    pub(crate) password: Option<Secret<String>>,

    /// The database queries run against, the server default if not set
    #[clap(short = 'd', long = "database", env = "CLICKHOUSE_DATABASE")]
    pub(crate) database: Option<String>,

    /// Send requests over https
    #[clap(long = "https", env = "CLICKHOUSE_USE_HTTPS", default_value_t = false)]
    pub(crate) use_https: bool,

    /// Ask the server to compress responses
    #[clap(
        long = "compress",
        env = "CLICKHOUSE_COMPRESS_RESPONSE",
        default_value_t = false
    )]
    pub(crate) compress: bool,

    /// Maximum duration of a query, in human readable form, e.g. `30s`, `2m`
    #[clap(
        long = "timeout",
        env = "CLICKHOUSE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub(crate) timeout: Duration,

    /// Extra `key=value` URL parameter, may be repeated, e.g. `--url-param max_threads=2`
    #[clap(short = 'p', long = "url-param", action = clap::ArgAction::Append)]
    pub(crate) url_params: Vec<String>,
}

impl ClickHouseConfig {
    pub(crate) fn client(&self) -> Result<Client, chclient::Error> {
        let mut credentials = Credentials::new()
            .with_user(&self.user)
            .with_url_params(self.url_params.iter().cloned());
        if let Some(password) = &self.password {
            credentials = credentials.with_password(password.expose_secret());
        }
        if let Some(database) = &self.database {
            credentials = credentials.with_database(database);
        }

        let mut client = Client::new(&self.addr)?
            .with_https(self.use_https)
            .with_compression(self.compress)
            .with_timeout(self.timeout)
            .with_credentials(credentials);
        if let Some(fallback) = &self.fallback_addr {
            client = client.with_fallback_addr(fallback)?;
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config = ClickHouseConfig::try_parse_from(["chquery"]).unwrap();
        let client = config.client().unwrap();

        assert_eq!(client.addr(), "localhost:8123");
        assert_eq!(client.fallback_addr(), None);
        assert_eq!(client.timeout(), Duration::from_secs(30));
        assert_eq!(client.credentials().user(), "default");
        assert_eq!(client.credentials().database(), None);
        assert!(client.credentials().url_params().is_empty());
    }

    #[test]
    fn all_options() {
        let config = ClickHouseConfig::try_parse_from([
            "chquery",
            "--addr",
            "ch-1:8443",
            "--fallback-addr",
            "ch-2:8443",
            "--user",
            "analyst",
            "--password",
            "hunter2",
            "--database",
            "metrics",
            "--https",
            "--compress",
            "--timeout",
            "2m",
            "-p",
            "max_threads=2",
            "-p",
            "no_cache=1",
        ])
        .unwrap();
        let client = config.client().unwrap();

        assert_eq!(client.addr(), "ch-1:8443");
        assert_eq!(client.fallback_addr(), Some("ch-2:8443"));
        assert_eq!(client.timeout(), Duration::from_secs(120));
        assert_eq!(client.credentials().user(), "analyst");
        assert_eq!(client.credentials().database(), Some("metrics"));
        assert_eq!(
            client.credentials().url_params(),
            ["max_threads=2", "no_cache=1"]
        );
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn bad_address() {
        let config = ClickHouseConfig::try_parse_from(["chquery", "--addr", "bad host"]).unwrap();
        assert!(config.client().is_err());
    }
}
