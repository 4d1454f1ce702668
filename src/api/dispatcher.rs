use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Action, ActionKind, ApiRequest, ApiResult, ResponseEnvelope};
use crate::autocrypt::{Autocrypt, AutocryptStore, PeerStore, Recommendation};
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::continuation::{ContinuationNotFound, ContinuationStore, NotFoundReason, TokenId};
use crate::engine::{CryptoEngine, EngineResult, LocalEngine, Operation, OperationLog, OperationOutput};
use crate::error::{ApiError, ErrorCode};
use crate::interaction::{RequiredInput, SensitiveInput, UserInput};
use crate::keys::store::{KeyRepository, KeyStore, SecretKeyRepository};
use crate::keys::KeyId;
use crate::permission::{
    AppStore, CallerHandle, CallerIdentity, CallerIdentityResolver, PackageRegistry,
    PermissionCheck, PermissionGuard, PermissionStore,
};
use crate::resolve::{KeyResolutionOutcome, KeyResolutionRequest, KeyResolver};

/// Which call a continuation belongs to: the action and a digest of all of
/// its parameters. A resubmission must match both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CallTag {
    kind: ActionKind,
    digest: [u8; 32],
}

impl CallTag {
    fn of(action: &Action) -> Result<Self, ApiError> {
        let encoded = serde_json::to_vec(action)
            .map_err(|e| ApiError::Store(anyhow::Error::new(e).context("failed to encode action")))?;
        Ok(Self {
            kind: action.kind(),
            digest: Sha256::digest(&encoded).into(),
        })
    }
}

/// A paused call, parked in the continuation store.
struct PendingCall {
    package: String,
    call: CallTag,
    caller: CallerIdentity,
    /// The step still waiting for the user. `None` once the user has
    /// answered and the app only needs to resubmit.
    step: Option<RequiredInput>,
    inputs: SensitiveInput,
}

/// Non-sensitive view of a paused call for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInteraction {
    pub package: String,
    pub action: ActionKind,
    pub required: Option<RequiredInput>,
}

/// Either a value to carry on with, or a step the user has to take first.
enum Flow<T> {
    Proceed(T),
    Ask(RequiredInput),
}

enum Ran {
    Done(OperationOutput),
    Suspended(ResponseEnvelope),
}

/// Everything the gateway talks to.
pub struct Collaborators {
    pub callers: Arc<dyn CallerIdentityResolver>,
    pub apps: Arc<dyn PermissionStore>,
    pub peers: Arc<dyn AutocryptStore>,
    pub keys: Arc<dyn KeyRepository>,
    pub secrets: Arc<dyn SecretKeyRepository>,
    pub engine: Arc<dyn CryptoEngine>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// File-backed stores under `home` and the local engine.
    pub fn local(home: &Path) -> Self {
        let store = Arc::new(KeyStore::open_at(home.to_path_buf()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            callers: Arc::new(PackageRegistry::open_at(store.packages_path())),
            apps: Arc::new(AppStore::open_at(store.apps_path())),
            peers: Arc::new(PeerStore::open_at(store.autocrypt_dir())),
            keys: store.clone(),
            secrets: store.clone(),
            engine: Arc::new(LocalEngine::new(store.clone(), store, clock.clone())),
            clock,
        }
    }
}

/// The API dispatcher: authenticates each call, runs it, and parks it in the
/// continuation store whenever the user has to step in.
pub struct Gateway {
    callers: Arc<dyn CallerIdentityResolver>,
    guard: PermissionGuard,
    autocrypt: Arc<Autocrypt>,
    resolver: KeyResolver,
    keys: Arc<dyn KeyRepository>,
    secrets: Arc<dyn SecretKeyRepository>,
    engine: Arc<dyn CryptoEngine>,
    clock: Arc<dyn Clock>,
    continuations: ContinuationStore<PendingCall>,
}

fn certificate_fingerprint(certificate: &[u8]) -> String {
    hex::encode(Sha256::digest(certificate))
}

fn not_found() -> ApiError {
    ApiError::ContinuationNotFound(ContinuationNotFound {
        reason: NotFoundReason::Unknown,
    })
}

impl Gateway {
    pub fn new(collaborators: Collaborators, config: &GatewayConfig) -> Self {
        let Collaborators {
            callers,
            apps,
            peers,
            keys,
            secrets,
            engine,
            clock,
        } = collaborators;

        let autocrypt = Arc::new(Autocrypt::new(
            peers.clone(),
            keys.clone(),
            secrets.clone(),
            clock.clone(),
            config.autocrypt.stale_after(),
        ));
        Self {
            callers,
            guard: PermissionGuard::new(apps, peers),
            resolver: KeyResolver::new(autocrypt.clone(), keys.clone(), clock.clone()),
            autocrypt,
            keys,
            secrets,
            engine,
            continuations: ContinuationStore::new(
                clock.clone(),
                config.continuation.ttl(),
                config.continuation.resume_wait(),
                config.continuation.max_pending,
            ),
            clock,
        }
    }

    pub fn guard(&self) -> &PermissionGuard {
        &self.guard
    }

    pub fn pending_count(&self) -> usize {
        self.continuations.len()
    }

    /// Handle one call. Never fails: every outcome is an envelope.
    pub async fn execute(&self, handle: &CallerHandle, request: ApiRequest) -> ResponseEnvelope {
        let action = request.action.kind();
        match self.dispatch(handle, request).await {
            Ok(envelope) => envelope,
            Err(err) => {
                match err.code() {
                    ErrorCode::Internal => {
                        tracing::error!(uid = handle.uid, ?action, "request failed: {:#}", err)
                    }
                    ErrorCode::NoPermission => {
                        tracing::warn!(uid = handle.uid, ?action, "request refused: {}", err)
                    }
                    _ => tracing::info!(uid = handle.uid, ?action, "request failed: {}", err),
                }
                ResponseEnvelope::error(&err)
            }
        }
    }

    async fn dispatch(
        &self,
        handle: &CallerHandle,
        request: ApiRequest,
    ) -> Result<ResponseEnvelope, ApiError> {
        let Some(caller) = self.callers.resolve(handle)? else {
            tracing::warn!(uid = handle.uid, "no package known for caller");
            return Err(ApiError::NotRegistered);
        };
        let call = CallTag::of(&request.action)?;

        let inputs = match request.continuation {
            Some(token) => {
                let pending = self.continuations.resume(Some(token)).await?;
                if pending.package != caller.package || pending.call != call {
                    tracing::warn!(
                        package = %caller.package,
                        token = %token,
                        "continuation belongs to another call"
                    );
                    return Err(not_found());
                }
                if let Some(step) = &pending.step {
                    // Resubmitted before the user answered.
                    let envelope = ResponseEnvelope::interaction(token, step.kind());
                    self.continuations.rearm(token, pending);
                    return Ok(envelope);
                }
                pending.inputs
            }
            None => SensitiveInput::default(),
        };

        match self.guard.check(&caller)? {
            PermissionCheck::Allowed => {}
            PermissionCheck::NeedsRegistration(caller) => {
                let required = RequiredInput::Registration {
                    package: caller.package.clone(),
                    fingerprint: certificate_fingerprint(&caller.certificate),
                };
                return Ok(self.suspend(&caller, call, required, inputs));
            }
            PermissionCheck::CertificateMismatch => {
                let required = RequiredInput::CertificateMismatch {
                    package: caller.package.clone(),
                };
                return Ok(self.suspend(&caller, call, required, inputs));
            }
        }

        match request.action {
            Action::CheckPermission => Ok(ResponseEnvelope::success(ApiResult::Permitted)),
            Action::GetKeyIds {
                identifiers,
                opportunistic,
            } => {
                let request = KeyResolutionRequest {
                    identifiers,
                    key_ids: Vec::new(),
                    opportunistic,
                };
                match self.recipients(&caller.package, &request, &inputs)? {
                    Flow::Proceed((key_ids, recommendation)) => {
                        Ok(ResponseEnvelope::success(ApiResult::KeyIds {
                            key_ids,
                            recommendation,
                        }))
                    }
                    Flow::Ask(required) => Ok(self.suspend(&caller, call, required, inputs)),
                }
            }
            Action::GetKey { key_id } => {
                let key = self
                    .keys
                    .public_key(key_id)?
                    .ok_or(ApiError::KeyNotFound(key_id))?;
                Ok(ResponseEnvelope::success(ApiResult::Key {
                    key_id,
                    key: key.to_text(),
                }))
            }
            Action::Sign { key_id, data } => {
                let key_id = match self.signing_key(&caller, key_id, &inputs)? {
                    Flow::Proceed(key_id) => key_id,
                    Flow::Ask(required) => return Ok(self.suspend(&caller, call, required, inputs)),
                };
                match self
                    .run(&caller, call, Operation::Sign { key_id, data }, inputs)
                    .await?
                {
                    Ran::Done(OperationOutput::Signature(signature)) => {
                        Ok(ResponseEnvelope::success(ApiResult::Signature { signature }))
                    }
                    Ran::Done(_) => Err(ApiError::InvariantViolation("sign produced no signature")),
                    Ran::Suspended(envelope) => Ok(envelope),
                }
            }
            Action::Encrypt {
                identifiers,
                key_ids,
                opportunistic,
                sign,
                signing_key,
                data,
            } => {
                let request = KeyResolutionRequest {
                    identifiers,
                    key_ids,
                    opportunistic,
                };
                let (recipients, recommendation) =
                    match self.recipients(&caller.package, &request, &inputs)? {
                        Flow::Proceed(resolved) => resolved,
                        Flow::Ask(required) => {
                            return Ok(self.suspend(&caller, call, required, inputs))
                        }
                    };

                let sign_with = if sign || signing_key.is_some() {
                    match self.signing_key(&caller, signing_key, &inputs)? {
                        Flow::Proceed(key_id) => Some(key_id),
                        Flow::Ask(required) => {
                            return Ok(self.suspend(&caller, call, required, inputs))
                        }
                    }
                } else {
                    None
                };

                let operation = Operation::Encrypt {
                    recipients,
                    data,
                    sign_with,
                };
                match self.run(&caller, call, operation, inputs).await? {
                    Ran::Done(OperationOutput::Encrypted(data)) => {
                        Ok(ResponseEnvelope::success(ApiResult::Encrypted {
                            data,
                            recommendation,
                        }))
                    }
                    Ran::Done(_) => Err(ApiError::InvariantViolation("encrypt produced no ciphertext")),
                    Ran::Suspended(envelope) => Ok(envelope),
                }
            }
            Action::DecryptVerify { data } => {
                match self
                    .run(&caller, call, Operation::DecryptVerify { data }, inputs)
                    .await?
                {
                    Ran::Done(OperationOutput::Decrypted { data, verification }) => {
                        Ok(ResponseEnvelope::success(ApiResult::Decrypted {
                            data,
                            verification,
                        }))
                    }
                    Ran::Done(_) => Err(ApiError::InvariantViolation("decrypt produced no plaintext")),
                    Ran::Suspended(envelope) => Ok(envelope),
                }
            }
            Action::AutocryptStatus { peers } => {
                let status = self.autocrypt.status(&caller.package, &peers)?;
                Ok(ResponseEnvelope::success(ApiResult::AutocryptStatus(status)))
            }
            Action::UpdateAutocryptPeer {
                peer_id,
                direct,
                gossip,
            } => {
                let direct = direct
                    .map(|update| self.autocrypt.update_direct(&caller.package, &peer_id, &update))
                    .transpose()?;
                let gossip = gossip
                    .iter()
                    .map(|update| self.autocrypt.update_gossip(&caller.package, &peer_id, update))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(ResponseEnvelope::success(ApiResult::AutocryptUpdated {
                    direct,
                    gossip,
                }))
            }
            Action::Backup { key_ids } => {
                if key_ids.is_empty() {
                    return Err(ApiError::NoIdentifiersOrKeys);
                }
                for key_id in &key_ids {
                    if !self.guard.check_key_access(&caller, *key_id)? {
                        return Err(ApiError::KeyNotPermitted(*key_id));
                    }
                }
                match self
                    .run(&caller, call, Operation::Backup { key_ids }, inputs)
                    .await?
                {
                    Ran::Done(OperationOutput::Backup(armored)) => {
                        let armored = String::from_utf8(armored).map_err(|_| {
                            ApiError::InvariantViolation("backup is not ASCII armored")
                        })?;
                        Ok(ResponseEnvelope::success(ApiResult::Backup { armored }))
                    }
                    Ran::Done(_) => Err(ApiError::InvariantViolation("backup produced no export")),
                    Ran::Suspended(envelope) => Ok(envelope),
                }
            }
        }
    }

    fn suspend(
        &self,
        caller: &CallerIdentity,
        call: CallTag,
        required: RequiredInput,
        inputs: SensitiveInput,
    ) -> ResponseEnvelope {
        let kind = required.kind();
        let token = self.continuations.pause(PendingCall {
            package: caller.package.clone(),
            call,
            caller: caller.clone(),
            step: Some(required),
            inputs,
        });
        tracing::info!(package = %caller.package, token = %token, ?kind, "waiting for user");
        ResponseEnvelope::interaction(token, kind)
    }

    /// Recipients for a call: the user's explicit choice if there is one,
    /// else whatever the resolver finds.
    fn recipients(
        &self,
        package: &str,
        request: &KeyResolutionRequest,
        inputs: &SensitiveInput,
    ) -> Result<Flow<(Vec<KeyId>, Recommendation)>, ApiError> {
        if let Some(selected) = &inputs.selected_keys {
            if selected.is_empty() {
                return Err(ApiError::NoIdentifiersOrKeys);
            }
            return Ok(Flow::Proceed((selected.clone(), Recommendation::Available)));
        }

        match self.resolver.resolve(package, request)? {
            KeyResolutionOutcome::Resolved {
                key_ids,
                recommendation,
            } => Ok(Flow::Proceed((key_ids, recommendation))),
            KeyResolutionOutcome::AmbiguousOrMissing {
                found,
                missing,
                duplicate,
            } => Ok(Flow::Ask(RequiredInput::KeyChoice {
                found,
                missing,
                duplicate,
            })),
            KeyResolutionOutcome::Rejected(_) => Err(ApiError::OpportunisticMissingKeys),
        }
    }

    /// The secret key to sign with. An explicitly requested key needs a
    /// grant; otherwise the user's own key is used, or chosen by the user
    /// when there are several.
    fn signing_key(
        &self,
        caller: &CallerIdentity,
        requested: Option<KeyId>,
        inputs: &SensitiveInput,
    ) -> Result<Flow<KeyId>, ApiError> {
        if let Some(key_id) = requested {
            if self.guard.check_key_access(caller, key_id)? {
                return Ok(Flow::Proceed(key_id));
            }
            return Ok(Flow::Ask(RequiredInput::KeyPermission { key_id }));
        }

        let now = self.clock.unix_now();
        let mut own = Vec::new();
        for key_id in self.secrets.list_secret()? {
            if self
                .keys
                .public_key(key_id)?
                .is_some_and(|key| key.is_usable_at(now))
            {
                own.push(key_id);
            }
        }

        if let Some(chosen) = inputs.signing_key {
            if own.contains(&chosen) {
                return Ok(Flow::Proceed(chosen));
            }
            return Err(ApiError::KeyNotFound(chosen));
        }

        match own.as_slice() {
            [] => Err(ApiError::Engine(OperationLog::error(
                "no usable secret key to sign with",
            ))),
            [key_id] => Ok(Flow::Proceed(*key_id)),
            _ => Ok(Flow::Ask(RequiredInput::SigningKeyChoice { candidates: own })),
        }
    }

    /// Run the engine off the async executor.
    async fn run(
        &self,
        caller: &CallerIdentity,
        call: CallTag,
        operation: Operation,
        inputs: SensitiveInput,
    ) -> Result<Ran, ApiError> {
        let engine = Arc::clone(&self.engine);
        let result = tokio::task::spawn_blocking(move || engine.execute(&operation, inputs))
            .await
            .map_err(|e| ApiError::Store(anyhow::Error::new(e).context("engine task failed")))?;

        match result {
            EngineResult::Success(output) => Ok(Ran::Done(output)),
            EngineResult::Pending { required, state } => {
                Ok(Ran::Suspended(self.suspend(caller, call, required, state)))
            }
            EngineResult::Failure { log } => Err(ApiError::Engine(log)),
        }
    }

    // --- UI collaborator ---

    /// What a paused call is waiting for. Does not consume the token.
    pub fn describe(&self, token: TokenId) -> Result<PendingInteraction, ApiError> {
        self.continuations
            .inspect(token, |pending| PendingInteraction {
                package: pending.package.clone(),
                action: pending.call.kind,
                required: pending.step.clone(),
            })
            .ok_or_else(not_found)
    }

    /// Apply the user's answer to a paused call. Consent side effects happen
    /// here, exactly once. On success the same token is live again and the
    /// app resubmits with it.
    pub async fn complete(&self, token: TokenId, input: UserInput) -> Result<TokenId, ApiError> {
        let mut pending = self.continuations.resume(Some(token)).await?;
        let Some(step) = pending.step.take() else {
            self.continuations.rearm(token, pending);
            return Err(ApiError::InputMismatch);
        };

        match (step, input) {
            (_, UserInput::Deny) => {
                tracing::info!(package = %pending.package, token = %token, "user denied");
                return Err(ApiError::Denied);
            }
            (RequiredInput::CertificateMismatch { .. }, _) => {
                tracing::warn!(
                    package = %pending.package,
                    "refusing to approve a caller with a mismatched certificate"
                );
                return Err(ApiError::CertificateMismatch);
            }
            (RequiredInput::Registration { .. }, UserInput::Approve) => {
                self.guard.register(&pending.caller)?;
            }
            (RequiredInput::KeyPermission { key_id }, UserInput::Approve) => {
                self.guard.grant_key_access(&pending.caller, key_id)?;
            }
            (
                RequiredInput::KeyChoice {
                    found,
                    missing,
                    duplicate,
                },
                UserInput::SelectKeys(keys),
            ) => {
                match self.choice_offered(&found, &missing, &duplicate, &keys) {
                    Ok(true) => pending.inputs.selected_keys = Some(keys),
                    offered => {
                        tracing::warn!(package = %pending.package, token = %token, "selection outside the offered keys");
                        pending.step = Some(RequiredInput::KeyChoice {
                            found,
                            missing,
                            duplicate,
                        });
                        self.continuations.rearm(token, pending);
                        return Err(offered.err().unwrap_or(ApiError::InputMismatch));
                    }
                }
            }
            (RequiredInput::SigningKeyChoice { candidates }, UserInput::SelectKeys(keys))
                if keys.len() == 1 && candidates.contains(&keys[0]) =>
            {
                pending.inputs.signing_key = Some(keys[0]);
            }
            (
                RequiredInput::Passphrase { key_id, .. },
                UserInput::Passphrase {
                    key_id: given,
                    passphrase,
                },
            ) if key_id == given => {
                pending.inputs.passphrases.insert(key_id, passphrase);
            }
            (RequiredInput::BackupCode, UserInput::BackupCode(code)) => {
                pending.inputs.backup_code = Some(code);
            }
            (
                RequiredInput::SecurityWarning {
                    overridable: true, ..
                },
                UserInput::AcknowledgeWarning,
            ) => {
                pending.inputs.acknowledged_warning = true;
            }
            (RequiredInput::SecurityToken { .. }, UserInput::SecurityTokenResponse(response)) => {
                pending.inputs.security_token_response = Some(response);
            }
            (step, _) => {
                pending.step = Some(step);
                self.continuations.rearm(token, pending);
                return Err(ApiError::InputMismatch);
            }
        }

        tracing::debug!(package = %pending.package, token = %token, "interaction completed");
        self.continuations.rearm(token, pending);
        Ok(token)
    }

    /// Whether `selected` stays within a key choice. When the request named
    /// recipients, only the keys found for them qualify; a request that named
    /// nothing may pick any usable key in the store.
    fn choice_offered(
        &self,
        found: &[KeyId],
        missing: &[String],
        duplicate: &[String],
        selected: &[KeyId],
    ) -> Result<bool, ApiError> {
        if !found.is_empty() || !missing.is_empty() || !duplicate.is_empty() {
            return Ok(selected.iter().all(|key_id| found.contains(key_id)));
        }
        let now = self.clock.unix_now();
        for key_id in selected {
            if !self
                .keys
                .public_key(*key_id)?
                .is_some_and(|key| key.is_usable_at(now))
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drop a paused call.
    pub fn cancel(&self, token: TokenId) -> bool {
        self.continuations.cancel(token)
    }
}
