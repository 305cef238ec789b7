//! Discord channel adapter using serenity

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::Client;
use serenity::all::{
    ChannelId, Context, CreateMessage, EditMember, EventHandler, GatewayIntents, GuildChannel,
    GuildId, Message, MessageId, Permissions, Ready, RoleId, UserId,
};
use serenity::http::Http;
use tokio::sync::mpsc;

use super::{Channel, ChannelEvent, DISCORD_MESSAGE_LIMIT, IncomingMessage, OutgoingMessage, chunk_message};
use crate::actions::{ActionExecutor, ActionParams, AuthorizedAction, ExecutionScope};
use crate::{Error, Result};

/// Discord channel adapter
pub struct DiscordChannel {
    token: String,
    event_tx: Option<mpsc::Sender<ChannelEvent>>,
    http: Option<Arc<Http>>,
    connected: bool,
}

impl DiscordChannel {
    /// Create with an event receiver
    ///
    /// Returns the channel and a receiver for everything the gateway reports
    #[must_use]
    pub fn with_receiver(token: String) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let channel = Self {
            token,
            event_tx: Some(tx),
            http: None,
            connected: false,
        };
        (channel, rx)
    }

    /// HTTP handle, available once connected
    #[must_use]
    pub fn http(&self) -> Option<Arc<Http>> {
        self.http.clone()
    }

    fn require_http(&self) -> Result<&Arc<Http>> {
        self.http
            .as_ref()
            .ok_or_else(|| Error::Channel("Discord not connected".to_string()))
    }
}

fn parse_id(raw: &str, what: &str) -> Result<u64> {
    raw.parse()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| Error::Channel(format!("invalid {what} id {raw:?}")))
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn connect(&mut self) -> Result<()> {
        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::GUILD_MEMBERS
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let handler = DiscordHandler {
            event_tx: self.event_tx.clone(),
            channel_names: StdMutex::new(HashMap::new()),
        };

        let client = Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| Error::Channel(format!("Discord client error: {e}")))?;

        self.http = Some(client.http.clone());

        let mut client_runner = client;
        tokio::spawn(async move {
            if let Err(e) = client_runner.start().await {
                tracing::error!(error = %e, "Discord client error");
            }
        });

        self.connected = true;
        tracing::info!("Discord channel connected");

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.event_tx = None;
        tracing::info!("Discord channel disconnected");
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        let http = self.require_http()?;
        let channel = ChannelId::new(parse_id(&message.channel_id, "channel")?);
        let reply_to = message
            .reply_to
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok())
            .filter(|id| *id != 0)
            .map(MessageId::new);

        for (i, chunk) in chunk_message(&message.content, DISCORD_MESSAGE_LIMIT)
            .into_iter()
            .enumerate()
        {
            let mut builder = CreateMessage::new().content(chunk);
            if i == 0
                && let Some(reply_to) = reply_to
            {
                builder = builder.reference_message((channel, reply_to));
            }
            channel
                .send_message(http, builder)
                .await
                .map_err(|e| Error::Channel(format!("Discord send error: {e}")))?;
        }

        tracing::debug!(channel_id = %message.channel_id, "Discord message sent");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send_typing(&self, channel_id: &str) -> Result<()> {
        let http = self.require_http()?;
        let channel = ChannelId::new(parse_id(channel_id, "channel")?);

        channel
            .broadcast_typing(http)
            .await
            .map_err(|e| Error::Channel(format!("Discord typing error: {e}")))?;

        tracing::debug!(channel_id, "Discord typing indicator sent");
        Ok(())
    }
}

/// Discord event handler
///
/// Forwards every message, including other bots'; the classifier decides
/// what to ignore.
struct DiscordHandler {
    event_tx: Option<mpsc::Sender<ChannelEvent>>,
    /// Guild channel names, looked up once per channel for the blacklist
    channel_names: StdMutex<HashMap<ChannelId, Option<String>>>,
}

impl DiscordHandler {
    async fn forward(&self, event: ChannelEvent) {
        if let Some(tx) = &self.event_tx
            && let Err(e) = tx.send(event).await
        {
            tracing::warn!(error = %e, "failed to forward Discord event");
        }
    }

    async fn channel_name(&self, ctx: &Context, msg: &Message) -> Option<String> {
        msg.guild_id?;
        let cached = self
            .channel_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&msg.channel_id)
            .cloned();
        if let Some(name) = cached {
            return name;
        }

        let name = match msg.channel_id.to_channel(ctx).await {
            Ok(channel) => channel.guild().map(|c| c.name),
            Err(e) => {
                tracing::debug!(channel_id = %msg.channel_id, error = %e, "channel lookup failed");
                return None;
            }
        };
        self.channel_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg.channel_id, name.clone());
        name
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "Discord bot ready");
        self.forward(ChannelEvent::Ready {
            agent_id: ready.user.id.to_string(),
            agent_name: ready.user.name.clone(),
        })
        .await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let author_name = msg
            .member
            .as_ref()
            .and_then(|m| m.nick.clone())
            .or_else(|| msg.author.global_name.clone())
            .unwrap_or_else(|| msg.author.name.clone());

        let timestamp = DateTime::<Utc>::from_timestamp(msg.timestamp.unix_timestamp(), 0)
            .unwrap_or_else(Utc::now);

        let incoming = IncomingMessage {
            id: msg.id.to_string(),
            channel_id: msg.channel_id.to_string(),
            channel_name: self.channel_name(&ctx, &msg).await,
            guild_id: msg.guild_id.map(|g| g.to_string()),
            author_id: msg.author.id.to_string(),
            author_name,
            author_is_bot: msg.author.bot,
            content: msg.content.clone(),
            timestamp,
            mentions: msg.mentions.iter().map(|u| u.id.to_string()).collect(),
        };

        tracing::trace!(
            channel_id = %incoming.channel_id,
            author_id = %incoming.author_id,
            "Discord message received"
        );
        self.forward(ChannelEvent::Message(incoming)).await;
    }

    async fn channel_delete(
        &self,
        _ctx: Context,
        channel: GuildChannel,
        _messages: Option<Vec<Message>>,
    ) {
        self.channel_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel.id);
        self.forward(ChannelEvent::ChannelDeleted {
            channel_id: channel.id.to_string(),
        })
        .await;
    }
}

/// Carries out authorized actions through the Discord HTTP API
pub struct DiscordExecutor {
    http: Arc<Http>,
}

impl DiscordExecutor {
    /// Create an executor from a connected client's HTTP handle
    #[must_use]
    pub const fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    fn guild(scope: &ExecutionScope) -> Result<GuildId> {
        let raw = scope
            .guild_id
            .as_deref()
            .ok_or_else(|| Error::Action("action needs a server".to_string()))?;
        Ok(GuildId::new(parse_id(raw, "guild")?))
    }

    /// Refuse to moderate the owner or anyone holding admin or manage-server
    async fn ensure_moderatable(&self, guild: GuildId, user: UserId) -> Result<()> {
        let partial = guild
            .to_partial_guild(&self.http)
            .await
            .map_err(|e| Error::Action(format!("could not load server: {e}")))?;
        let member = guild
            .member(&self.http, user)
            .await
            .map_err(|e| Error::Action(format!("could not load member: {e}")))?;

        let everyone = RoleId::new(guild.get());
        let role_permissions = partial
            .roles
            .iter()
            .filter(|(id, _)| **id == everyone || member.roles.contains(*id))
            .map(|(_, role)| role.permissions);
        if is_privileged(partial.owner_id == user, role_permissions) {
            tracing::info!(%guild, %user, "refusing to moderate a privileged member");
            return Err(Error::Action(format!("<@{user}> has moderator permissions")));
        }
        Ok(())
    }
}

/// Server owner, administrator, or manage-server holder
fn is_privileged(is_owner: bool, role_permissions: impl IntoIterator<Item = Permissions>) -> bool {
    let granted = role_permissions
        .into_iter()
        .fold(Permissions::empty(), |acc, p| acc | p);
    is_owner || granted.intersects(Permissions::ADMINISTRATOR | Permissions::MANAGE_GUILD)
}

impl std::fmt::Debug for DiscordExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl ActionExecutor for DiscordExecutor {
    async fn execute(&self, action: &AuthorizedAction, scope: &ExecutionScope) -> Result<String> {
        let target = action
            .target_id
            .as_deref()
            .map(|raw| parse_id(raw, "user").map(UserId::new))
            .transpose()?;
        let reason = action
            .reason
            .clone()
            .unwrap_or_else(|| format!("requested by {}", action.requester.display_name));

        match (&action.params, target) {
            (ActionParams::Timeout { minutes }, Some(user)) => {
                let guild = Self::guild(scope)?;
                self.ensure_moderatable(guild, user).await?;
                let until = Utc::now() + chrono::Duration::minutes(*minutes);
                guild
                    .edit_member(
                        &self.http,
                        user,
                        EditMember::new()
                            .disable_communication_until(until.to_rfc3339())
                            .audit_log_reason(&reason),
                    )
                    .await
                    .map_err(|e| Error::Action(format!("timeout failed: {e}")))?;
                Ok(format!("timed out <@{user}> for {minutes} minutes"))
            }
            (ActionParams::Ban, Some(user)) => {
                let guild = Self::guild(scope)?;
                self.ensure_moderatable(guild, user).await?;
                guild
                    .ban_with_reason(&self.http, user, 0, &reason)
                    .await
                    .map_err(|e| Error::Action(format!("ban failed: {e}")))?;
                Ok(format!("banned <@{user}>"))
            }
            (ActionParams::Nickname { nickname }, Some(user)) => {
                let guild = Self::guild(scope)?;
                self.ensure_moderatable(guild, user).await?;
                guild
                    .edit_member(
                        &self.http,
                        user,
                        EditMember::new()
                            .nickname(nickname.trim())
                            .audit_log_reason(&reason),
                    )
                    .await
                    .map_err(|e| Error::Action(format!("nickname failed: {e}")))?;
                Ok(format!("renamed <@{user}> to {nickname}"))
            }
            (ActionParams::Dm { message }, Some(user)) => {
                let dm = user
                    .create_dm_channel(&self.http)
                    .await
                    .map_err(|e| Error::Action(format!("dm failed: {e}")))?;
                dm.id
                    .send_message(&self.http, CreateMessage::new().content(message.trim()))
                    .await
                    .map_err(|e| Error::Action(format!("dm failed: {e}")))?;
                Ok(format!("sent a direct message to <@{user}>"))
            }
            (ActionParams::VoiceJoin | ActionParams::ImageSearch { .. }, _) => Err(Error::Action(
                format!("{} is not supported on this transport", action.kind),
            )),
            (_, None) => Err(Error::Action(format!("{} needs a target", action.kind))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admins_and_server_managers_are_privileged() {
        assert!(is_privileged(
            false,
            [Permissions::SEND_MESSAGES, Permissions::ADMINISTRATOR]
        ));
        assert!(is_privileged(false, [Permissions::MANAGE_GUILD]));
        assert!(is_privileged(true, [Permissions::empty()]));
    }

    #[test]
    fn ordinary_moderators_are_not_privileged() {
        assert!(!is_privileged(
            false,
            [
                Permissions::SEND_MESSAGES,
                Permissions::KICK_MEMBERS | Permissions::MODERATE_MEMBERS,
            ]
        ));
        assert!(!is_privileged(false, [Permissions::empty()]));
    }
}
