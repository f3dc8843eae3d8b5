use std::time::Duration;

use anyhow::Context;
use kimaki_core::{IpcRequest, IpcResponse, IpcStatus, NewIpcRequest};
use rusqlite::{OptionalExtension, Row, params};
use tracing::{info, warn};

use crate::{IpcRequestStore, StatusCounts, Store, now_millis};

const SELECT_COLUMNS: &str =
    "id, type, session_id, thread_id, payload, response, status, created_at, claimed_at, updated_at";

impl Store {
    /// Insert a new `pending` request. Workers normally write rows directly;
    /// this is the same insert for the HTTP front door and tests.
    pub fn create_ipc_request(&self, request: &NewIpcRequest) -> anyhow::Result<IpcRequest> {
        self.create_ipc_request_at(request, now_millis())
    }

    pub(crate) fn create_ipc_request_at(
        &self,
        request: &NewIpcRequest,
        now: i64,
    ) -> anyhow::Result<IpcRequest> {
        let payload = if request.payload.is_null() {
            "{}".to_string()
        } else {
            request.payload.to_string()
        };
        self.with_conn(|conn| {
            let query = format!(
                "\
                INSERT INTO ipc_requests
                  (id, type, session_id, thread_id, payload, status, created_at, updated_at)
                VALUES (lower(hex(randomblob(16))), ?1, ?2, ?3, ?4, 'pending', ?5, ?5)
                RETURNING {SELECT_COLUMNS}
                "
            );
            conn.query_row(
                &query,
                params![
                    request.request_type,
                    request.session_id,
                    request.thread_id,
                    payload,
                    now
                ],
                row_to_request,
            )
            .context("create_ipc_request")
        })
    }

    pub fn get_ipc_request(&self, id: &str) -> anyhow::Result<Option<IpcRequest>> {
        self.with_conn(|conn| {
            let query = format!("SELECT {SELECT_COLUMNS} FROM ipc_requests WHERE id = ?1");
            conn.query_row(&query, params![id], row_to_request)
                .optional()
                .context("get_ipc_request")
        })
    }

    pub fn status_counts(&self) -> anyhow::Result<StatusCounts> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM ipc_requests GROUP BY status")
                .context("prepare status counts")?;
            let mut rows = stmt.query([]).context("status counts")?;
            let mut counts = StatusCounts::default();
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let count = count.max(0) as u64;
                match status.parse::<IpcStatus>() {
                    Ok(IpcStatus::Pending) => counts.pending = count,
                    Ok(IpcStatus::Processing) => counts.processing = count,
                    Ok(IpcStatus::Completed) => counts.completed = count,
                    Ok(IpcStatus::Cancelled) => counts.cancelled = count,
                    Err(_) => warn!(status = %status, count, "ignoring unknown IPC status"),
                }
            }
            Ok(counts)
        })
    }

    pub(crate) fn claim_pending_at(&self, now: i64) -> anyhow::Result<Vec<IpcRequest>> {
        self.with_conn(|conn| {
            // One statement: a row is claimed only if it is still pending when
            // SQLite applies the update, so two claimers can never both win it.
            let query = format!(
                "\
                UPDATE ipc_requests
                SET status = 'processing', claimed_at = ?1, updated_at = ?1
                WHERE status = 'pending'
                RETURNING seq, {SELECT_COLUMNS}
                "
            );
            let mut stmt = conn.prepare(&query).context("prepare claim")?;
            let mut claimed = stmt
                .query_map(params![now], |row| {
                    let seq: i64 = row.get(0)?;
                    Ok((seq, row_to_request_offset(row, 1)?))
                })
                .context("claim_pending_ipc_requests")?
                .collect::<Result<Vec<_>, _>>()
                .context("read claimed rows")?;
            // RETURNING order is unspecified.
            claimed.sort_by_key(|(seq, request)| (request.created_at, *seq));
            Ok(claimed.into_iter().map(|(_, request)| request).collect())
        })
    }

    pub(crate) fn cancel_stale_at(&self, ttl: Duration, now: i64) -> anyhow::Result<usize> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(ttl_ms);
        let response =
            IpcResponse::error(format!("IPC request timed out after {}s", ttl.as_secs())).to_json();
        self.with_conn(|conn| {
            conn.execute(
                "\
                UPDATE ipc_requests
                SET status = 'cancelled', response = ?1, updated_at = ?2
                WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at <= ?3
                ",
                params![response, now, cutoff],
            )
            .context("cancel_stale_processing_requests")
        })
    }
}

impl IpcRequestStore for Store {
    fn claim_pending_ipc_requests(&self) -> anyhow::Result<Vec<IpcRequest>> {
        self.claim_pending_at(now_millis())
    }

    fn complete_ipc_request(&self, id: &str, response: &str) -> anyhow::Result<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "\
                UPDATE ipc_requests
                SET status = 'completed', response = ?2, updated_at = ?3
                WHERE id = ?1 AND status IN ('pending', 'processing')
                ",
                params![id, response, now_millis()],
            )
            .context("complete_ipc_request")
        })?;
        Ok(changed > 0)
    }

    fn cancel_all_pending_ipc_requests(&self) -> anyhow::Result<usize> {
        let response = IpcResponse::error("Bot restarted, request cancelled").to_json();
        let cancelled = self.with_conn(|conn| {
            conn.execute(
                "\
                UPDATE ipc_requests
                SET status = 'cancelled', response = ?1, updated_at = ?2
                WHERE status IN ('pending', 'processing')
                ",
                params![response, now_millis()],
            )
            .context("cancel_all_pending_ipc_requests")
        })?;
        if cancelled > 0 {
            info!(cancelled, "cancelled IPC requests left by a previous run");
        }
        Ok(cancelled)
    }

    fn cancel_stale_processing_requests(&self, ttl: Duration) -> anyhow::Result<usize> {
        self.cancel_stale_at(ttl, now_millis())
    }
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<IpcRequest> {
    row_to_request_offset(row, 0)
}

fn row_to_request_offset(row: &Row<'_>, base: usize) -> rusqlite::Result<IpcRequest> {
    let status: String = row.get(base + 6)?;
    let status = status.parse::<IpcStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            base + 6,
            rusqlite::types::Type::Text,
            err.into(),
        )
    })?;
    Ok(IpcRequest {
        id: row.get(base)?,
        request_type: row.get(base + 1)?,
        session_id: row.get(base + 2)?,
        thread_id: row.get(base + 3)?,
        payload: row.get(base + 4)?,
        response: row.get(base + 5)?,
        status,
        created_at: row.get(base + 7)?,
        claimed_at: row.get(base + 8)?,
        updated_at: row.get(base + 9)?,
    })
}
