use std::env;
use std::sync::Arc;

use case_engine::config::{self, Settings};
use case_engine::moderation::publisher::log_case_batches;
use case_engine::moderation::{
    BroadcastPublisher, CaseEngine, DirectMessageNotifier, ExpiryCheckRequest, ExpiryRunner,
    MemoryCaseStore, MemoryLockService, Platform, ReconciliationListener, SerenityPlatform,
};
use case_engine::{Data, DataInner, Error, commands, handlers, logging};
use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use tracing::{error, info};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    // Initialize logging
    logging::init()?;

    // Load environment variables
    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;

    let config_path = config::config_path();
    let settings = Arc::new(Settings::load(&config_path).await);
    if !config_path.exists() {
        // Leave a template to edit
        settings.save(&config_path).await?;
        info!(path = %config_path.display(), "Default configuration written");
    }
    let cases_path = config::cases_path();
    let store = Arc::new(MemoryCaseStore::load(&cases_path).await);
    let locks = Arc::new(MemoryLockService::new());

    let publisher = Arc::new(BroadcastPublisher::new(256));
    tokio::spawn(log_case_batches(publisher.subscribe()));

    // Drop expired locks now and then
    let purge_locks = Arc::clone(&locks);
    let purge_every = settings.engine.lock_ttl();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            purge_locks.purge_expired();
        }
    });

    let setup_store = Arc::clone(&store);
    let setup_settings = Arc::clone(&settings);
    let setup_cases_path = cases_path.clone();

    // Configure the Poise framework
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![commands::case(), commands::pardon(), commands::reason()],
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                let platform: Arc<dyn Platform> =
                    Arc::new(SerenityPlatform::new(Arc::clone(&ctx.http)));
                let notifier = Arc::new(DirectMessageNotifier::new(Arc::clone(&ctx.http)));
                let engine = Arc::new(CaseEngine::new(
                    setup_store.clone(),
                    locks,
                    Arc::clone(&platform),
                    notifier,
                    publisher,
                    Arc::clone(&setup_settings),
                ));
                let listener =
                    ReconciliationListener::new(Arc::clone(&engine), platform, ready.user.id.get());

                let (expiry_tx, _expiry_task) = ExpiryRunner::new(Arc::clone(&engine))
                    .start(setup_settings.engine.expiry_poll_interval());
                if let Err(e) = expiry_tx.send(ExpiryCheckRequest::CheckAll).await {
                    error!("Failed to send startup expiry check: {e}");
                }

                let data = Data::new(DataInner {
                    settings: setup_settings,
                    store: setup_store,
                    engine,
                    listener: Arc::new(listener),
                    expiry_tx,
                    cases_path: setup_cases_path,
                });
                // Gateway handlers read the data from serenity's map
                ctx.data.write().await.insert::<Data>(data.clone());

                logging::log_console("Registering commands");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        })
        .build();

    // Bans and member removals drive reconciliation
    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_MEMBERS;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(handlers::Handler)
        .framework(framework)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(err) = client.start().await {
        error!("Error running the bot: {err}");
    }

    let data = client.data.read().await.get::<Data>().cloned();
    match data {
        Some(data) => data.save().await?,
        None => {
            store.save(&cases_path).await?;
            info!(path = %cases_path.display(), "Case snapshot saved");
        }
    }
    Ok(())
}

fn main() {
    // Run the async main function
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::from)
        .and_then(|runtime| runtime.block_on(async_main()));

    // Handle any errors that occurred during execution
    if let Err(err) = result {
        eprintln!("Error: {err}");
    }
}
