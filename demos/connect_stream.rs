use std::error::Error;
use std::sync::Arc;

use pushstream_sdk::stream::client::PushClient;
use pushstream_sdk::stream::proto::{channel_name, FilterConfig, ListFilter, TagTypeMode};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = PushClient::new().with_token_provider(move || {
            let token = access_token.clone();
            async move { Some(SecretString::new(token)) }
        });
        let mut connection = client.start();
        let controller = connection.controller();

        controller.join(channel_name("repo", "team", "42"))?;
        controller.filter(
            "activity",
            Arc::new(FilterConfig {
                tag_type_mode: TagTypeMode::Or,
                tags: ListFilter {
                    whitelist: Some(vec!["release".to_string(), "deploy".to_string()]),
                    blacklist: None,
                },
                types: ListFilter::default(),
            }),
        )?;
        controller.open()?;

        while let Some(envelope) = connection.recv().await {
            println!(
                "id={} kind={} channel={} payload={}",
                envelope.id,
                envelope.kind,
                envelope.channel.as_deref().unwrap_or("-"),
                envelope.payload.unwrap_or_default(),
            );
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
