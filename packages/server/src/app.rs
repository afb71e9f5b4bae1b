//! Dependency wiring shared by the server binary and the integration tests.
//!
//! Order: collaborators -> registry / rate limiter / auth gate -> use cases
//! -> session context.

use std::{sync::Arc, time::Duration};

use irori_shared::time::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{CredentialVerifier, FanoutBus, MessageStore, UserDirectory},
    usecase::{
        AuthGate, AuthGateConfig, ConnectParticipantUseCase, DisconnectParticipantUseCase,
        PresenceRegistry, RateLimitConfig, RateLimiter, RegistryLimits, SendMessageUseCase,
        SessionConfig, SessionContext,
    },
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppConfig {
    pub limits: RegistryLimits,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthGateConfig,
    pub session: SessionConfig,
    /// Ceiling on waiting for a replaced session to clean up
    pub eviction_wait: Duration,
    pub sweep_interval: Duration,
    /// Connections idle for longer than this are swept
    pub stale_after: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            limits: RegistryLimits::default(),
            rate_limit: RateLimitConfig::default(),
            auth: AuthGateConfig::default(),
            session: SessionConfig::default(),
            eviction_wait: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// External collaborators.
pub struct Collaborators {
    pub verifier: Arc<dyn CredentialVerifier>,
    pub directory: Arc<dyn UserDirectory>,
    pub store: Arc<dyn MessageStore>,
    pub fanout: Arc<dyn FanoutBus>,
    pub clock: Arc<dyn Clock>,
}

pub struct App {
    pub config: AppConfig,
    pub context: Arc<SessionContext>,
    pub auth_gate: Arc<AuthGate>,
    pub rate_limiter: Arc<RateLimiter>,
    pub registry: Arc<PresenceRegistry>,
}

impl App {
    pub fn build(config: AppConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            verifier,
            directory,
            store,
            fanout,
            clock,
        } = collaborators;

        let registry = Arc::new(PresenceRegistry::new(config.limits, clock.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let auth_gate = Arc::new(AuthGate::new(verifier, directory, clock.clone(), config.auth));

        let connect = Arc::new(ConnectParticipantUseCase::new(
            auth_gate.clone(),
            rate_limiter.clone(),
            registry.clone(),
            store.clone(),
            config.eviction_wait,
        ));
        let disconnect = Arc::new(DisconnectParticipantUseCase::new(
            registry.clone(),
            fanout.clone(),
            clock.clone(),
        ));
        let send_message = Arc::new(SendMessageUseCase::new(store.clone(), fanout.clone()));

        let context = Arc::new(SessionContext {
            connect,
            disconnect,
            send_message,
            registry: registry.clone(),
            rate_limiter: rate_limiter.clone(),
            store,
            fanout,
            clock,
            config: config.session,
        });

        Self {
            config,
            context,
            auth_gate,
            rate_limiter,
            registry,
        }
    }

    /// Start the stale-connection sweep, the auth cache sweep and idle
    /// rate-limiter eviction. Everything stops when `shutdown` is cancelled.
    pub fn start_maintenance(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.registry
            .start_sweeper(self.config.sweep_interval, self.config.stale_after);
        let auth_sweeper = self.auth_gate.start_sweeper(shutdown.clone());

        let rate_limiter = self.rate_limiter.clone();
        let interval = self.config.sweep_interval;
        let idle_for = self.config.stale_after;
        let limiter_sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                rate_limiter.evict_idle(idle_for);
            }
        });

        vec![auth_sweeper, limiter_sweeper]
    }
}
