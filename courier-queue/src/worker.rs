//! Durable mail queue worker
//!
//! Consumes the mail stream through a consumer group, delivers entries
//! via the mail transport, retries failures up to a bound, and
//! dead-letters entries that exhaust their budget. The broker's
//! consumer-group state is the single source of truth for attempt
//! counts and pending status: the worker keeps no ledger of its own and
//! can be restarted at any point without losing work.

use anyhow::{anyhow, Context, Result};
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::config::QueueConfig;
use courier_core::models::{DeadLetter, MailMessage};
use courier_core::service::{mailer::mask_email, MailTransport};

/// Timeout for Redis connection establishment in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay after a broken connection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay after repeated connection failures
const MAX_BACKOFF_SECS: u64 = 30;

/// Reason recorded on dead-letter records for exhausted entries
const REASON_MAX_RETRIES: &str = "max retries";

/// Whether an entry's delivery attempt count has exhausted its budget.
///
/// The first delivery counts as attempt 1, so an entry is given exactly
/// `max_retries` delivery attempts before it is dead-lettered.
const fn exceeds_retry_budget(attempt: u64, max_retries: u64) -> bool {
    attempt > max_retries
}

/// Unique consumer name for this worker instance.
///
/// Uniqueness matters: two workers sharing a name would double-claim
/// entries within the group.
fn generate_consumer_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("mail-worker-{host}-{}", nanoid::nanoid!(6))
}

/// Describes how the consume loop ended.
#[derive(Debug, PartialEq, Eq)]
enum WorkerExit {
    /// Cancellation was requested; the worker returns cleanly.
    Cancelled,
    /// A stream operation failed (connection lost); the worker
    /// reconnects with backoff.
    ConnectionLost,
}

/// Consumer-group worker for the outbound mail stream.
pub struct MailQueueWorker {
    redis_client: RedisClient,
    transport: Arc<dyn MailTransport>,
    config: QueueConfig,
    consumer_name: String,
    cancel_token: CancellationToken,
}

impl MailQueueWorker {
    pub fn new(
        redis_url: &str,
        transport: Arc<dyn MailTransport>,
        config: QueueConfig,
    ) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

        Ok(Self {
            redis_client,
            transport,
            config,
            consumer_name: generate_consumer_name(),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Shut down the worker after the in-flight batch completes
    pub fn shutdown(&self) {
        info!("Shutting down mail queue worker");
        self.cancel_token.cancel();
    }

    /// Run the worker until cancelled.
    ///
    /// Consumer-group bootstrap failure (other than the group already
    /// existing) is fatal and propagates; everything after that is
    /// either retried in place or left pending for reclaim.
    pub async fn run(&self) -> Result<()> {
        self.bootstrap_group().await?;
        info!(
            consumer = %self.consumer_name,
            stream = %self.config.stream,
            group = %self.config.group,
            "Mail queue worker started"
        );

        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            let mut conn = match timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                self.redis_client.get_multiplexed_async_connection(),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    conn
                }
                Ok(Err(e)) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff_secs,
                        "Failed to get Redis connection for mail worker, retrying"
                    );
                    if self.sleep_or_cancel(backoff_secs).await {
                        return Ok(());
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
                Err(_) => {
                    error!(
                        backoff_secs = backoff_secs,
                        "Timed out getting Redis connection for mail worker, retrying"
                    );
                    if self.sleep_or_cancel(backoff_secs).await {
                        return Ok(());
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };

            if self.consume_loop(&mut conn).await == WorkerExit::Cancelled {
                info!("Mail queue worker stopped");
                return Ok(());
            }

            if self.sleep_or_cancel(backoff_secs).await {
                return Ok(());
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    /// Sleep with cancellation support; returns true if cancelled.
    async fn sleep_or_cancel(&self, secs: u64) -> bool {
        tokio::select! {
            () = self.cancel_token.cancelled() => {
                info!("Mail queue worker cancelled during backoff");
                true
            }
            () = tokio::time::sleep(Duration::from_secs(secs)) => false,
        }
    }

    /// Ensure the consumer group exists, creating it positioned at
    /// "only new entries" if absent. "Group already exists" is not an
    /// error; anything else aborts startup.
    async fn bootstrap_group(&self) -> Result<()> {
        let mut conn = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_multiplexed_async_connection(),
        )
        .await
        .context("Timed out connecting to Redis for group bootstrap")?
        .context("Failed to connect to Redis for group bootstrap")?;

        let created: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "$")
            .await;

        match created {
            Ok(_) => {
                info!(
                    stream = %self.config.stream,
                    group = %self.config.group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(
                    stream = %self.config.stream,
                    group = %self.config.group,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(anyhow!(e).context("Failed to create consumer group")),
        }
    }

    /// Read and process batches until cancellation or a broken
    /// connection.
    ///
    /// Cancellation is only observed between reads: entries already
    /// delivered by the broker run through their full acknowledge/retry
    /// decision before the loop exits, so shutdown never leaves an
    /// entry's outcome ambiguous.
    async fn consume_loop(&self, conn: &mut redis::aio::MultiplexedConnection) -> WorkerExit {
        loop {
            let reply = tokio::select! {
                () = self.cancel_token.cancelled() => return WorkerExit::Cancelled,
                reply = self.read_batch(conn) => reply,
            };

            match reply {
                Ok(Some(reply)) => {
                    for stream_key in reply.keys {
                        for entry in stream_key.ids {
                            if let Err(e) = self.process_entry(conn, &entry).await {
                                warn!(
                                    id = %entry.id,
                                    error = %e,
                                    "Entry processing failed, leaving pending for retry"
                                );
                            }
                        }
                    }
                }
                // Block timeout with no new entries; not an error.
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Stream read failed, reconnecting");
                    return WorkerExit::ConnectionLost;
                }
            }

            // Sweep entries stuck pending on crashed or stalled
            // consumers anywhere in the group.
            if let Err(e) = self.reclaim_stuck_entries(conn).await {
                warn!(error = %e, "Pending-entry sweep failed");
            }
        }
    }

    /// Read up to one batch of new entries assigned to this consumer,
    /// blocking up to the configured wait. `None` means the wait
    /// elapsed with nothing to do.
    async fn read_batch(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<Option<StreamReadReply>> {
        let opts = StreamReadOptions::default()
            .group(&self.config.group, &self.consumer_name)
            .count(self.config.batch_size)
            .block((self.config.block_seconds * 1000) as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream], &[">"], &opts)
            .await
            .context("XREADGROUP failed")?;

        Ok(reply.filter(|r| !r.keys.is_empty()))
    }

    /// Run one entry through the acknowledge/retry/dead-letter decision.
    pub(crate) async fn process_entry(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        entry: &StreamId,
    ) -> Result<()> {
        let mail = match MailMessage::from_fields(&entry.map) {
            Ok(mail) => mail,
            Err(e) => {
                // A malformed entry can never become deliverable;
                // acknowledge it so it stops occupying the pending list.
                error!(
                    id = %entry.id,
                    error = %e,
                    "Malformed mail entry, acknowledging without delivery"
                );
                let _: u64 = conn
                    .xack(&self.config.stream, &self.config.group, &[&entry.id])
                    .await
                    .context("XACK of malformed entry failed")?;
                return Ok(());
            }
        };

        let attempt = self.delivery_attempt(conn, &entry.id).await?;
        if exceeds_retry_budget(attempt, self.config.max_retries) {
            self.dead_letter(conn, &entry.id, &mail, REASON_MAX_RETRIES)
                .await?;
            return Ok(());
        }

        debug!(
            id = %entry.id,
            to = %mask_email(&mail.to),
            attempt = attempt,
            "Delivering mail"
        );

        match self.transport.deliver(&mail).await {
            Ok(()) => self.acknowledge(conn, &entry.id, &mail).await,
            Err(e) => {
                // Recoverable: the entry stays pending and will be
                // reclaimed once it has idled long enough.
                warn!(
                    id = %entry.id,
                    to = %mask_email(&mail.to),
                    attempt = attempt,
                    error = %e,
                    "Delivery failed, entry remains pending"
                );
                Ok(())
            }
        }
    }

    /// Current delivery attempt for an entry, from the group's
    /// pending-entry metadata. First delivery = attempt 1; an entry not
    /// in the pending list at all is treated as a first attempt.
    async fn delivery_attempt(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        entry_id: &str,
    ) -> Result<u64> {
        let reply: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.stream,
                &self.config.group,
                entry_id,
                entry_id,
                1,
            )
            .await
            .context("XPENDING lookup failed")?;

        Ok(reply
            .ids
            .first()
            .map_or(1, |pending| pending.times_delivered.max(1) as u64))
    }

    /// Acknowledge a delivered entry and reclaim its stream space.
    ///
    /// XDEL and XTRIM are housekeeping; their failure does not affect
    /// correctness and is only logged.
    async fn acknowledge(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        entry_id: &str,
        mail: &MailMessage,
    ) -> Result<()> {
        let _: u64 = conn
            .xack(&self.config.stream, &self.config.group, &[entry_id])
            .await
            .context("XACK failed")?;

        if let Err(e) = conn
            .xdel::<_, _, u64>(&self.config.stream, &[entry_id])
            .await
        {
            warn!(id = %entry_id, error = %e, "XDEL failed");
        }
        if let Err(e) = conn
            .xtrim::<_, u64>(
                &self.config.stream,
                StreamMaxlen::Approx(self.config.trim_max_len),
            )
            .await
        {
            warn!(error = %e, "XTRIM failed");
        }

        info!(
            id = %entry_id,
            to = %mask_email(&mail.to),
            "Mail delivered and acknowledged"
        );
        Ok(())
    }

    /// Terminally relocate an entry to the dead-letter stream.
    async fn dead_letter(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        entry_id: &str,
        mail: &MailMessage,
        reason: &str,
    ) -> Result<()> {
        let record = DeadLetter::new(entry_id, mail, reason);

        let _: u64 = conn
            .xack(&self.config.stream, &self.config.group, &[entry_id])
            .await
            .context("XACK before dead-letter failed")?;

        let fields = record.to_fields();
        let _: String = conn
            .xadd(&self.config.dead_letter_stream, "*", &fields)
            .await
            .context("Failed to append dead-letter record")?;

        warn!(
            id = %entry_id,
            to = %mask_email(&mail.to),
            reason = %reason,
            "Entry moved to dead-letter stream"
        );
        Ok(())
    }

    /// Reclaim entries left pending by crashed or stalled consumers.
    ///
    /// Fetches pending entries across the whole group and claims any
    /// idle beyond the threshold, then runs each claimed entry through
    /// the normal per-entry decision, which dead-letters the ones
    /// already past their retry budget instead of re-sending them.
    async fn reclaim_stuck_entries(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<()> {
        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.stream,
                &self.config.group,
                "-",
                "+",
                self.config.batch_size,
            )
            .await
            .context("XPENDING scan failed")?;

        if pending.ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = pending.ids.iter().map(|item| item.id.clone()).collect();

        // XCLAIM's min-idle filter keeps entries another consumer is
        // actively working on out of the reply.
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.stream,
                &self.config.group,
                &self.consumer_name,
                self.config.min_idle_seconds * 1000,
                &ids,
            )
            .await
            .context("XCLAIM failed")?;

        for entry in &claimed.ids {
            info!(id = %entry.id, "Reclaimed pending entry");
            if let Err(e) = self.process_entry(conn, entry).await {
                warn!(
                    id = %entry.id,
                    error = %e,
                    "Reclaimed entry processing failed, leaving pending"
                );
            }
        }

        Ok(())
    }
}
