use crate::moderation::PlatformEvent;
use crate::{Data, ERROR_TARGET, EVENT_TARGET};
use poise::serenity_prelude::{
    self as serenity, Context, EventHandler, GuildId, Member, Ready, User,
};
use tracing::{debug, error, info, warn};

pub struct Handler;

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!("Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!("Cache ready! The bot is in {guild_count} guild(s)");

        // Catch up on reversals that came due while offline
        let Some(data) = ctx.data.read().await.get::<Data>().cloned() else {
            return;
        };
        for guild_id in guilds {
            data.request_expiry_check(guild_id.get()).await;
        }
    }

    async fn guild_ban_addition(&self, ctx: Context, guild_id: GuildId, banned_user: User) {
        let event = PlatformEvent::BanAdded {
            guild_id: guild_id.get(),
            user_id: banned_user.id.get(),
            user_tag: banned_user.tag(),
        };
        reconcile(&ctx, event).await;
    }

    async fn guild_ban_removal(&self, ctx: Context, guild_id: GuildId, unbanned_user: User) {
        let event = PlatformEvent::BanRemoved {
            guild_id: guild_id.get(),
            user_id: unbanned_user.id.get(),
            user_tag: unbanned_user.tag(),
        };
        reconcile(&ctx, event).await;
    }

    async fn guild_member_removal(
        &self,
        ctx: Context,
        guild_id: GuildId,
        user: User,
        _member_data_if_available: Option<Member>,
    ) {
        let event = PlatformEvent::MemberRemoved {
            guild_id: guild_id.get(),
            user_id: user.id.get(),
            user_tag: user.tag(),
        };
        reconcile(&ctx, event).await;
    }
}

/// Forward a gateway event to the reconciliation listener
async fn reconcile(ctx: &Context, event: PlatformEvent) {
    let Some(data) = ctx.data.read().await.get::<Data>().cloned() else {
        debug!(target: EVENT_TARGET, ?event, "Bot data not ready, dropping event");
        return;
    };

    match data.listener.reconcile(event.clone()).await {
        Ok(Some(case)) => info!(
            target: EVENT_TARGET,
            guild_id = case.guild_id,
            case_number = case.case_number,
            action = %case.action,
            "External action recorded"
        ),
        Ok(None) => {}
        Err(e) => error!(
            target: ERROR_TARGET,
            ?event,
            error = %e,
            "Failed to reconcile gateway event"
        ),
    }
}
