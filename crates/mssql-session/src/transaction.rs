//! Client transaction lifecycle.
//!
//! An API-facing [`Transaction`] handle fronts an [`InternalTransaction`]
//! that tracks the server-side state. The handle holds the only strong
//! reference to the internal's shell link; the internal keeps a weak
//! back-reference, so an abandoned handle never pins server-side state.
//! The session owns internals by descriptor in a [`TransactionRegistry`]
//! (arena ownership breaks the session/transaction cycle); terminal state
//! removes them from the registry.
//!
//! State transitions are driven by server environment-change tokens
//! parsed out of the read pipeline. Commit on a modern server does not
//! zombie eagerly: it waits for the server's env-change, and in the
//! window between the commit write and that token the handle reports
//! zombied while retaining its internal reference, so a user rollback in
//! that window clears silently instead of throwing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tds_wire::{
    encode_begin_request, encode_commit_request, encode_rollback_request, encode_save_request,
    EnvChange, EnvChangeKind, IsolationLevel, PacketType,
};

use crate::error::{Result, SessionError, UNASSOCIATED_OPERATION};
use crate::events;
use crate::session::{Session, SessionShared};

/// Server-side transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created locally; server confirmation outstanding.
    Pending,
    /// Confirmed by the server.
    Active,
    /// Rolled back (terminal).
    Aborted,
    /// Committed (terminal).
    Committed,
    /// Outcome unknown, e.g. defected mid-flight (terminal).
    Unknown,
}

impl TransactionState {
    /// Check if this state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted | Self::Committed | Self::Unknown)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Aborted => "aborted",
            Self::Committed => "committed",
            Self::Unknown => "unknown",
        }
    }
}

/// How a transaction came into being.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Observed `BEGIN TRANSACTION` in user TSQL.
    LocalFromTsql,
    /// Explicit API begin.
    LocalFromApi,
    /// Local transaction promoted to a distributed one.
    Delegated,
    /// Distributed (DTC) enlistment.
    Distributed,
    /// Ambient transaction context.
    Context,
}

/// Transaction state change observed in a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    /// A transaction began; the server issued its descriptor.
    Begun {
        /// Server-issued transaction descriptor.
        descriptor: u64,
    },
    /// The current transaction committed.
    Committed,
    /// The current transaction rolled back.
    RolledBack,
    /// The current transaction defected from the coordinator.
    Defected,
    /// The current transaction was promoted to distributed.
    Promoted,
}

/// The weak-referenced link between an internal transaction and its API
/// handle. Zombifying severs it.
#[derive(Debug, Default)]
pub struct HandleShell {
    zombied: AtomicBool,
}

impl HandleShell {
    /// Whether the handle has been zombied.
    #[must_use]
    pub fn is_zombied(&self) -> bool {
        self.zombied.load(Ordering::Acquire)
    }

    fn zombie(&self) {
        self.zombied.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
struct InternalInner {
    descriptor: u64,
    state: TransactionState,
    kind: TransactionType,
    open_results: i32,
    parent: Weak<HandleShell>,
    session: Option<Weak<SessionShared>>,
}

/// Session-side transaction record.
#[derive(Debug)]
pub struct InternalTransaction {
    inner: Mutex<InternalInner>,
}

impl InternalTransaction {
    fn new(
        kind: TransactionType,
        parent: Weak<HandleShell>,
        session: Option<Weak<SessionShared>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(InternalInner {
                descriptor: 0,
                state: TransactionState::Pending,
                kind,
                open_results: 0,
                parent,
                session,
            }),
        })
    }

    /// Server-issued descriptor; zero until the server confirms.
    #[must_use]
    pub fn descriptor(&self) -> u64 {
        self.inner.lock().descriptor
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// How this transaction came into being.
    #[must_use]
    pub fn kind(&self) -> TransactionType {
        self.inner.lock().kind
    }

    /// Result sets currently open under this transaction.
    #[must_use]
    pub fn open_result_count(&self) -> i32 {
        self.inner.lock().open_results
    }

    /// Whether the session link has been severed.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.inner.lock().session.is_none()
    }

    fn activate(&self, descriptor: u64) {
        let mut inner = self.inner.lock();
        inner.descriptor = descriptor;
        inner.state = TransactionState::Active;
    }

    fn promote(&self) {
        let mut inner = self.inner.lock();
        inner.kind = TransactionType::Delegated;
    }

    fn result_opened(&self) {
        self.inner.lock().open_results += 1;
    }

    fn result_closed(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.open_results == 0 {
            return Err(SessionError::OpenResultCountExceeded);
        }
        inner.open_results -= 1;
        Ok(())
    }

    /// Move to a terminal state and zombie: sever the handle link and the
    /// session reference. Returns the open results left to transfer to
    /// the session-wide counter.
    fn complete(&self, terminal: TransactionState) -> i32 {
        debug_assert!(terminal.is_terminal());
        let mut inner = self.inner.lock();
        inner.state = terminal;
        inner.session = None;
        let leftover = std::mem::take(&mut inner.open_results);
        if let Some(shell) = inner.parent.upgrade() {
            shell.zombie();
        }
        inner.parent = Weak::new();
        leftover
    }
}

/// Session-owned arena of live transactions.
#[derive(Debug)]
pub struct TransactionRegistry {
    session_id: u64,
    by_descriptor: HashMap<u64, Arc<InternalTransaction>>,
    current: Option<Arc<InternalTransaction>>,
    non_transacted_open_results: i32,
}

impl TransactionRegistry {
    pub(crate) fn new(session_id: u64) -> Self {
        Self {
            session_id,
            by_descriptor: HashMap::new(),
            current: None,
            non_transacted_open_results: 0,
        }
    }

    /// The transaction currently governing requests, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<InternalTransaction>> {
        self.current.clone()
    }

    /// Descriptor to carry in request headers; zero in auto-commit.
    #[must_use]
    pub fn current_descriptor(&self) -> u64 {
        self.current.as_ref().map_or(0, |t| t.descriptor())
    }

    /// Result sets opened outside any transaction (or stranded by a
    /// terminated one) awaiting cleanup.
    #[must_use]
    pub fn non_transacted_open_results(&self) -> i32 {
        self.non_transacted_open_results
    }

    /// Number of live transactions in the arena.
    #[must_use]
    pub fn live_transactions(&self) -> usize {
        self.by_descriptor.len()
    }

    fn enlist(&mut self, internal: Arc<InternalTransaction>) -> Result<()> {
        if self.current.is_some() {
            return Err(SessionError::InvalidState(
                "a transaction is already in progress",
            ));
        }
        self.current = Some(internal);
        Ok(())
    }

    /// Count a result set opened under the current transaction (or the
    /// session-wide counter in auto-commit).
    pub fn result_opened(&mut self) {
        match &self.current {
            Some(internal) => internal.result_opened(),
            None => self.non_transacted_open_results += 1,
        }
    }

    /// Count a result set closed. Going negative is a protocol violation.
    pub fn result_closed(&mut self) -> Result<()> {
        match &self.current {
            Some(internal) => internal.result_closed(),
            None => {
                if self.non_transacted_open_results == 0 {
                    return Err(SessionError::OpenResultCountExceeded);
                }
                self.non_transacted_open_results -= 1;
                Ok(())
            }
        }
    }

    /// Drive the state machine from a server environment change.
    pub fn apply_env_change(&mut self, env: &EnvChange) -> Option<TransactionEvent> {
        match env.kind {
            EnvChangeKind::BeginTransaction => {
                let descriptor = env.transaction_descriptor()?;
                let internal = match self.current.take() {
                    Some(pending) if pending.state() == TransactionState::Pending => pending,
                    Some(active) => {
                        // Nested TSQL begin under an active transaction;
                        // the outer descriptor keeps governing requests.
                        tracing::debug!(descriptor, "nested transaction begin ignored");
                        self.current = Some(active);
                        return None;
                    }
                    // BEGIN TRANSACTION issued in user TSQL.
                    None => InternalTransaction::new(
                        TransactionType::LocalFromTsql,
                        Weak::new(),
                        None,
                    ),
                };
                internal.activate(descriptor);
                self.by_descriptor.insert(descriptor, Arc::clone(&internal));
                self.current = Some(internal);
                tracing::debug!(
                    descriptor = format_args!("0x{descriptor:016X}"),
                    "transaction begun"
                );
                events::with_sink(|s| s.transaction_state(self.session_id, descriptor, "active"));
                Some(TransactionEvent::Begun { descriptor })
            }
            EnvChangeKind::CommitTransaction => {
                self.complete_current(TransactionState::Committed, TransactionEvent::Committed)
            }
            EnvChangeKind::RollbackTransaction => {
                self.complete_current(TransactionState::Aborted, TransactionEvent::RolledBack)
            }
            EnvChangeKind::DefectTransaction => {
                self.complete_current(TransactionState::Unknown, TransactionEvent::Defected)
            }
            EnvChangeKind::DistributedTransactionBegin => {
                let descriptor = env.transaction_descriptor()?;
                let internal =
                    InternalTransaction::new(TransactionType::Distributed, Weak::new(), None);
                internal.activate(descriptor);
                self.by_descriptor.insert(descriptor, Arc::clone(&internal));
                self.current = Some(internal);
                events::with_sink(|s| s.transaction_state(self.session_id, descriptor, "active"));
                Some(TransactionEvent::Begun { descriptor })
            }
            EnvChangeKind::PromoteTransaction => {
                if let Some(current) = &self.current {
                    current.promote();
                    events::with_sink(|s| {
                        s.transaction_state(self.session_id, current.descriptor(), "promoted");
                    });
                }
                Some(TransactionEvent::Promoted)
            }
            _ => None,
        }
    }

    fn complete_current(
        &mut self,
        terminal: TransactionState,
        event: TransactionEvent,
    ) -> Option<TransactionEvent> {
        let internal = self.current.take()?;
        let descriptor = internal.descriptor();
        let leftover = internal.complete(terminal);
        self.non_transacted_open_results += leftover;
        self.by_descriptor.remove(&descriptor);
        tracing::debug!(
            descriptor = format_args!("0x{descriptor:016X}"),
            state = terminal.name(),
            leftover_results = leftover,
            "transaction completed"
        );
        events::with_sink(|s| s.transaction_state(self.session_id, descriptor, terminal.name()));
        Some(event)
    }

    /// Forcibly retire a transaction (client-side rollback or partial
    /// zombie cleanup), transferring stranded result counts.
    pub(crate) fn forget(&mut self, internal: &Arc<InternalTransaction>, terminal: TransactionState) {
        if let Some(current) = &self.current {
            if Arc::ptr_eq(current, internal) {
                self.current = None;
            }
        }
        self.by_descriptor.remove(&internal.descriptor());
        if !internal.state().is_terminal() {
            let leftover = internal.complete(terminal);
            self.non_transacted_open_results += leftover;
        }
    }
}

/// API-facing transaction handle.
///
/// All operations raise [`SessionError::TransactionZombied`] once the
/// transaction has completed, with one exception: a `rollback` issued in
/// the partial-zombie window after `commit` clears silently.
pub struct Transaction {
    shell: Arc<HandleShell>,
    internal: Mutex<Option<Arc<InternalTransaction>>>,
    isolation: IsolationLevel,
    partial_zombie: AtomicBool,
}

impl Transaction {
    /// The isolation level the transaction was begun with.
    #[must_use]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// Whether the handle is zombied (including the partial-zombie
    /// commit window).
    #[must_use]
    pub fn is_zombied(&self) -> bool {
        self.shell.is_zombied() || self.internal.lock().is_none()
    }

    /// Server-issued descriptor; zero before confirmation or after
    /// completion.
    #[must_use]
    pub fn descriptor(&self) -> u64 {
        self.internal
            .lock()
            .as_ref()
            .map_or(0, |internal| internal.descriptor())
    }

    fn require_usable(&self) -> Result<Arc<InternalTransaction>> {
        let guard = self.internal.lock();
        match guard.as_ref() {
            Some(internal) if !self.shell.is_zombied() && !internal.state().is_terminal() => {
                Ok(Arc::clone(internal))
            }
            _ => Err(SessionError::TransactionZombied),
        }
    }

    /// Commit the transaction.
    ///
    /// Waits for the server's commit env-change. When the response
    /// completes without it, the handle enters the partial-zombie window:
    /// it reports zombied but retains its internal reference so a
    /// subsequent rollback clears silently.
    pub async fn commit(&self, session: &mut Session) -> Result<()> {
        let internal = self.require_usable()?;
        let payload = encode_commit_request(internal.descriptor(), 1);
        session
            .send_request(PacketType::TransactionManager, &payload, UNASSOCIATED_OPERATION)
            .await?;

        match session.process_until_done().await {
            Ok(_summary) => {
                if internal.state() == TransactionState::Committed {
                    *self.internal.lock() = None;
                    self.shell.zombie();
                    Ok(())
                } else {
                    // The env-change is delayed: partial-zombie window.
                    tracing::debug!("commit acknowledged without env-change; partial zombie");
                    self.shell.zombie();
                    self.partial_zombie.store(true, Ordering::Release);
                    Ok(())
                }
            }
            Err(SessionError::Timeout) => {
                // The connection is in an indeterminate state and must be
                // aborted, never returned to a pool.
                session.shared().mark_broken();
                Err(SessionError::WaitTimeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Roll back the whole transaction.
    pub async fn rollback(&self, session: &mut Session) -> Result<()> {
        if self.partial_zombie.swap(false, Ordering::AcqRel) {
            // Legacy partial-zombie case: the commit is already on the
            // wire; clear the reference without traffic or error.
            if let Some(internal) = self.internal.lock().take() {
                session
                    .shared()
                    .registry()
                    .lock()
                    .forget(&internal, TransactionState::Unknown);
            }
            return Ok(());
        }

        let internal = self.require_usable()?;
        let payload = encode_rollback_request(internal.descriptor(), 1, None);
        session
            .send_request(PacketType::TransactionManager, &payload, UNASSOCIATED_OPERATION)
            .await?;
        session.process_until_done().await?;

        // The rollback env-change normally retires the internal; make
        // sure the handle side agrees even if the token was absent.
        session
            .shared()
            .registry()
            .lock()
            .forget(&internal, TransactionState::Aborted);
        *self.internal.lock() = None;
        self.shell.zombie();
        Ok(())
    }

    /// Roll back to a named savepoint. The transaction stays active.
    pub async fn rollback_to(&self, session: &mut Session, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(SessionError::NullEmptyTransactionName);
        }
        let internal = self.require_usable()?;
        let payload = encode_rollback_request(internal.descriptor(), 1, Some(name));
        session
            .send_request(PacketType::TransactionManager, &payload, UNASSOCIATED_OPERATION)
            .await?;
        session.process_until_done().await?;
        Ok(())
    }

    /// Create a named savepoint.
    pub async fn save(&self, session: &mut Session, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(SessionError::NullEmptyTransactionName);
        }
        let internal = self.require_usable()?;
        let payload = encode_save_request(internal.descriptor(), 1, name);
        session
            .send_request(PacketType::TransactionManager, &payload, UNASSOCIATED_OPERATION)
            .await?;
        session.process_until_done().await?;
        Ok(())
    }

    /// Dispose of the handle, rolling back implicitly when still active.
    /// Errors during dispose are swallowed.
    pub async fn dispose(&self, session: &mut Session) {
        if self.is_zombied() && !self.partial_zombie.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.rollback(session).await {
            tracing::debug!(%e, "error during transaction dispose ignored");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Best effort: sever the link so the handle cannot be observed
        // usable. The wire-level implicit rollback is `dispose`'s job;
        // the registry retires the internal when the server reports the
        // outcome or the session resets.
        if let Some(internal) = self.internal.get_mut().take() {
            if !internal.state().is_terminal() {
                tracing::debug!(
                    descriptor = internal.descriptor(),
                    "transaction handle dropped while active"
                );
            }
        }
        self.shell.zombie();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("isolation", &self.isolation)
            .field("zombied", &self.is_zombied())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Begin an explicit transaction at the given isolation level.
    ///
    /// Emits a transaction-manager begin request and consumes the
    /// response; the server's begin env-change activates the internal
    /// transaction and issues its descriptor.
    pub async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<Transaction> {
        let shell = Arc::new(HandleShell::default());
        let internal = InternalTransaction::new(
            TransactionType::LocalFromApi,
            Arc::downgrade(&shell),
            Some(Arc::downgrade(self.shared())),
        );
        self.shared()
            .registry()
            .lock()
            .enlist(Arc::clone(&internal))?;

        let payload = encode_begin_request(0, 1, isolation);
        let result = async {
            self.send_request(
                PacketType::TransactionManager,
                &payload,
                UNASSOCIATED_OPERATION,
            )
            .await?;
            self.process_until_done().await
        }
        .await;

        match result {
            Ok(summary) => {
                if summary.had_error {
                    self.shared()
                        .registry()
                        .lock()
                        .forget(&internal, TransactionState::Aborted);
                    let (errors, _, _) = self.take_errors();
                    return Err(errors.into_iter().next().unwrap_or(
                        SessionError::InvalidState("transaction begin failed"),
                    ));
                }
                Ok(Transaction {
                    shell,
                    internal: Mutex::new(Some(internal)),
                    isolation,
                    partial_zombie: AtomicBool::new(false),
                })
            }
            Err(e) => {
                self.shared()
                    .registry()
                    .lock()
                    .forget(&internal, TransactionState::Unknown);
                Err(e)
            }
        }
    }

    /// Descriptor to stamp into request headers; zero in auto-commit.
    #[must_use]
    pub fn transaction_descriptor(&self) -> u64 {
        self.shared().registry().lock().current_descriptor()
    }

    /// Count a result set opened under the current transaction.
    pub fn result_opened(&self) {
        self.shared().registry().lock().result_opened();
    }

    /// Count a result set closed under the current transaction.
    pub fn result_closed(&self) -> Result<()> {
        self.shared().registry().lock().result_closed()
    }
}
