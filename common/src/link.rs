use crate::config::StationCredential;

pub const MAX_CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unprovisioned,
    ConnectingSta,
    Connected,
    FallbackAp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StationStarted,
    Disconnected,
    AddressAcquired,
    CredentialsSubmitted(StationCredential),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Connect,
    ApplyCredential(StationCredential),
    StartFallbackAp,
    StopPortal,
    StartCloudServices,
}

// The adapter owns the WiFi driver; this type owns the retry budget and
// the one-shot guards.
#[derive(Debug)]
pub struct LinkSupervisor {
    state: LinkState,
    connect_failures: u32,
    cloud_started: bool,
    fallback_started: bool,
    portal_active: bool,
}

impl LinkSupervisor {
    pub fn provisioned() -> Self {
        Self {
            state: LinkState::ConnectingSta,
            connect_failures: 0,
            cloud_started: false,
            fallback_started: false,
            portal_active: false,
        }
    }

    // The adapter brings the setup AP and portal up itself on this path.
    pub fn unprovisioned() -> Self {
        Self {
            state: LinkState::Unprovisioned,
            connect_failures: 0,
            cloud_started: false,
            fallback_started: true,
            portal_active: true,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn connect_failures(&self) -> u32 {
        self.connect_failures
    }

    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        match event {
            LinkEvent::StationStarted => {
                if self.state == LinkState::ConnectingSta {
                    vec![LinkAction::Connect]
                } else {
                    Vec::new()
                }
            }
            LinkEvent::Disconnected => self.on_disconnected(),
            LinkEvent::AddressAcquired => self.on_address_acquired(),
            LinkEvent::CredentialsSubmitted(credential) => {
                // Fresh credential, fresh retry budget.
                self.connect_failures = 0;
                self.state = LinkState::ConnectingSta;
                vec![
                    LinkAction::ApplyCredential(credential),
                    LinkAction::Connect,
                ]
            }
        }
    }

    fn on_disconnected(&mut self) -> Vec<LinkAction> {
        match self.state {
            LinkState::ConnectingSta | LinkState::Connected => {
                self.connect_failures += 1;
                if self.connect_failures < MAX_CONNECT_ATTEMPTS {
                    self.state = LinkState::ConnectingSta;
                    return vec![LinkAction::Connect];
                }

                self.state = LinkState::FallbackAp;
                if self.fallback_started {
                    return Vec::new();
                }
                self.fallback_started = true;
                self.portal_active = true;
                vec![LinkAction::StartFallbackAp]
            }
            // No retry escape out of the fallback AP; only a credential
            // submission leaves it.
            LinkState::Unprovisioned | LinkState::FallbackAp => Vec::new(),
        }
    }

    fn on_address_acquired(&mut self) -> Vec<LinkAction> {
        self.state = LinkState::Connected;
        self.connect_failures = 0;

        let mut actions = Vec::new();
        if self.portal_active {
            self.portal_active = false;
            actions.push(LinkAction::StopPortal);
        }
        if !self.cloud_started {
            self.cloud_started = true;
            actions.push(LinkAction::StartCloudServices);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> StationCredential {
        StationCredential::new("home", "hunter22").unwrap()
    }

    #[test]
    fn station_start_kicks_connect() {
        let mut link = LinkSupervisor::provisioned();
        assert_eq!(link.handle(LinkEvent::StationStarted), vec![LinkAction::Connect]);
    }

    #[test]
    fn five_disconnects_enter_fallback_once() {
        let mut link = LinkSupervisor::provisioned();

        for _ in 0..MAX_CONNECT_ATTEMPTS - 1 {
            assert_eq!(link.handle(LinkEvent::Disconnected), vec![LinkAction::Connect]);
        }
        assert_eq!(
            link.handle(LinkEvent::Disconnected),
            vec![LinkAction::StartFallbackAp]
        );
        assert_eq!(link.state(), LinkState::FallbackAp);

        // Stray disconnects once in fallback change nothing.
        assert_eq!(link.handle(LinkEvent::Disconnected), Vec::new());
        assert_eq!(link.state(), LinkState::FallbackAp);
    }

    #[test]
    fn address_acquired_starts_cloud_once() {
        let mut link = LinkSupervisor::provisioned();

        assert_eq!(
            link.handle(LinkEvent::AddressAcquired),
            vec![LinkAction::StartCloudServices]
        );
        assert_eq!(link.state(), LinkState::Connected);

        // DHCP renewal.
        assert_eq!(link.handle(LinkEvent::AddressAcquired), Vec::new());
    }

    #[test]
    fn credentials_reset_the_retry_budget() {
        let mut link = LinkSupervisor::provisioned();
        for _ in 0..MAX_CONNECT_ATTEMPTS - 1 {
            link.handle(LinkEvent::Disconnected);
        }

        let actions = link.handle(LinkEvent::CredentialsSubmitted(credential()));
        assert_eq!(
            actions,
            vec![
                LinkAction::ApplyCredential(credential()),
                LinkAction::Connect
            ]
        );
        assert_eq!(link.connect_failures(), 0);

        // The budget starts over for the new credential.
        for _ in 0..MAX_CONNECT_ATTEMPTS - 1 {
            assert_eq!(link.handle(LinkEvent::Disconnected), vec![LinkAction::Connect]);
        }
    }

    #[test]
    fn drop_after_connect_retries_with_fresh_budget() {
        let mut link = LinkSupervisor::provisioned();
        for _ in 0..MAX_CONNECT_ATTEMPTS - 1 {
            link.handle(LinkEvent::Disconnected);
        }
        link.handle(LinkEvent::AddressAcquired);

        // The link dropping later is a new failure sequence.
        assert_eq!(link.handle(LinkEvent::Disconnected), vec![LinkAction::Connect]);
        assert_eq!(link.state(), LinkState::ConnectingSta);
        assert_eq!(link.connect_failures(), 1);
    }

    #[test]
    fn provisioning_session_stops_portal_on_success() {
        let mut link = LinkSupervisor::unprovisioned();
        assert_eq!(link.state(), LinkState::Unprovisioned);

        link.handle(LinkEvent::CredentialsSubmitted(credential()));
        assert_eq!(link.state(), LinkState::ConnectingSta);

        assert_eq!(
            link.handle(LinkEvent::AddressAcquired),
            vec![LinkAction::StopPortal, LinkAction::StartCloudServices]
        );
    }

    #[test]
    fn fallback_does_not_restart_an_active_portal() {
        let mut link = LinkSupervisor::unprovisioned();
        link.handle(LinkEvent::CredentialsSubmitted(credential()));

        // A bad password burns the whole budget with the AP already up.
        for _ in 0..MAX_CONNECT_ATTEMPTS - 1 {
            assert_eq!(link.handle(LinkEvent::Disconnected), vec![LinkAction::Connect]);
        }
        assert_eq!(link.handle(LinkEvent::Disconnected), Vec::new());
        assert_eq!(link.state(), LinkState::FallbackAp);
    }

    #[test]
    fn cloud_services_survive_reprovisioning() {
        let mut link = LinkSupervisor::provisioned();
        link.handle(LinkEvent::AddressAcquired);

        link.handle(LinkEvent::CredentialsSubmitted(credential()));
        assert_eq!(link.handle(LinkEvent::AddressAcquired), Vec::new());
    }
}
