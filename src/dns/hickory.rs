use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
    Resolver, TokioResolver,
};

use super::{TxtLookupError, TxtResolver};

/// Library based [`TxtResolver`].
///
/// Caching is disabled so every attempt reaches the nameservers.
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Queries `nameservers` over UDP port 53, or the library's default upstreams if empty.
    pub fn new(nameservers: &[IpAddr]) -> Self {
        let config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for ip in nameservers {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        opts.cache_size = 0;

        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();

        Self { resolver }
    }
}

impl std::fmt::Debug for HickoryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl TxtResolver for HickoryResolver {
    async fn resolve_txt(&self, host: &str) -> Result<Vec<String>, TxtLookupError> {
        let lookup = self
            .resolver
            .txt_lookup(host)
            .await
            .map_err(|err| TxtLookupError::Resolve {
                host: host.to_owned(),
                message: err.to_string(),
            })?;

        let records = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data))
                    .collect::<String>()
            })
            .collect::<Vec<_>>();

        log::trace!("{host}: {records:?}");

        Ok(records)
    }
}
