use anyhow::{anyhow, Result};
use livecache::{Coordinator, CoordinatorConfig, LoggingObserver, PipelineHandle, PipelineObserver};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

type Roles = BTreeSet<String>;

const BUTTONS_PER_ROW: usize = 5;

/// One role panel: a message whose buttons toggle roles
#[derive(Debug, Clone, Deserialize)]
struct PanelConfig {
    channel: String,
    message: String,
    /// Role id -> button label
    roles: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DemoConfig {
    #[serde(default)]
    coordinator: CoordinatorConfig,
    panels: Vec<PanelConfig>,
}

impl DemoConfig {
    fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path, e))?;
        let config: DemoConfig = serde_yaml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", path, e))?;
        config.coordinator.validate()?;
        if config.panels.is_empty() {
            anyhow::bail!("Config {} defines no panels", path);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
struct Button {
    role: String,
    label: String,
    active: bool,
}

type View = Vec<Vec<Button>>;

fn build_view(panel: &PanelConfig, roles: &Roles) -> View {
    let buttons: Vec<Button> = panel
        .roles
        .iter()
        .map(|(role, label)| Button {
            role: role.clone(),
            label: label.clone(),
            active: roles.contains(role),
        })
        .collect();
    buttons
        .chunks(BUTTONS_PER_ROW)
        .map(|row| row.to_vec())
        .collect()
}

/// Best guess at a member's roles from the buttons they were shown
fn roles_from_view(view: &View) -> Roles {
    view.iter()
        .flatten()
        .filter(|button| button.active)
        .map(|button| button.role.clone())
        .collect()
}

fn describe_view(view: &View) -> String {
    view.iter()
        .map(|row| {
            row.iter()
                .map(|b| format!("[{}{}]", if b.active { "*" } else { " " }, b.label))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" / ")
}

/// Stand-in for the remote membership API
#[derive(Clone)]
struct RoleService {
    members: Arc<tokio::sync::Mutex<HashMap<String, Roles>>>,
    latency: Duration,
}

impl RoleService {
    fn new(latency: Duration) -> Self {
        Self {
            members: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            latency,
        }
    }

    async fn set_role(&self, member: &str, role: &str, add: bool) -> Result<()> {
        sleep(self.latency).await;
        let mut members = self.members.lock().await;
        let roles = members.entry(member.to_string()).or_default();
        if add {
            roles.insert(role.to_string());
        } else {
            roles.remove(role);
        }
        Ok(())
    }

    async fn fetch_roles(&self, member: &str) -> Result<Roles> {
        sleep(self.latency / 2).await;
        let members = self.members.lock().await;
        Ok(members.get(member).cloned().unwrap_or_default())
    }
}

/// The member's private copy of the panel
#[derive(Clone)]
struct MemberPanel {
    view: Arc<Mutex<View>>,
    edit_latency: Duration,
}

impl MemberPanel {
    fn new(view: View, edit_latency: Duration) -> Self {
        Self {
            view: Arc::new(Mutex::new(view)),
            edit_latency,
        }
    }

    fn snapshot(&self) -> View {
        self.view.lock().map(|view| view.clone()).unwrap_or_default()
    }

    async fn edit(&self, view: View) -> Result<()> {
        sleep(self.edit_latency).await;
        let mut current = self
            .view
            .lock()
            .map_err(|_| anyhow!("panel view lock poisoned"))?;
        *current = view;
        Ok(())
    }
}

/// Optimistic render from the folded roles
async fn render_estimate(message: MemberPanel, panel: Arc<PanelConfig>, roles: Roles) -> Result<()> {
    message.edit(build_view(&panel, &roles)).await
}

/// Wait for the role change to land, then render what the service says
async fn render_reconciled(
    update: JoinHandle<Result<()>>,
    service: RoleService,
    member: String,
    message: MemberPanel,
    panel: Arc<PanelConfig>,
) -> Result<()> {
    update.await??;
    let roles = service.fetch_roles(&member).await?;
    message.edit(build_view(&panel, &roles)).await
}

fn handle_click(
    coordinator: &Coordinator<Roles>,
    service: &RoleService,
    panel: &Arc<PanelConfig>,
    message: &MemberPanel,
    member: &str,
    role: &str,
    add: bool,
) -> PipelineHandle {
    // The authoritative change starts right away, independent of the pipeline
    let update = {
        let service = service.clone();
        let member = member.to_string();
        let role = role.to_string();
        tokio::spawn(async move { service.set_role(&member, &role, add).await })
    };

    let seen = message.snapshot();
    let role = role.to_string();
    let (estimate_message, estimate_panel) = (message.clone(), Arc::clone(panel));
    let (service, member_id, message, panel) = (
        service.clone(),
        member.to_string(),
        message.clone(),
        Arc::clone(panel),
    );

    coordinator.submit(
        member,
        move |current| {
            let mut roles = match current {
                Some(roles) => roles.clone(),
                None => roles_from_view(&seen),
            };
            if add {
                roles.insert(role);
            } else {
                roles.remove(&role);
            }
            roles
        },
        move |roles| render_estimate(estimate_message, estimate_panel, roles),
        move || render_reconciled(update, service, member_id, message, panel),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "panels.yaml".to_string());
    let config = DemoConfig::load(&path)?;
    let panel = Arc::new(config.panels[0].clone());

    let observers: Vec<Arc<dyn PipelineObserver>> = vec![Arc::new(LoggingObserver)];
    let coordinator: Coordinator<Roles> = Coordinator::new(config.coordinator.clone(), observers)?;

    let service = RoleService::new(Duration::from_millis(120));
    let member = "member-42";
    service.set_role(member, "news", true).await?;

    let initial = service.fetch_roles(member).await?;
    let message = MemberPanel::new(build_view(&panel, &initial), Duration::from_millis(80));
    info!(
        "Panel {} in #{}: {}",
        panel.message,
        panel.channel,
        describe_view(&message.snapshot())
    );

    // Faster than either the panel edits or the role service can keep up with
    let clicks = [("red", true), ("blue", true), ("red", false), ("green", true)];
    let mut handles = Vec::new();
    for (role, add) in clicks {
        let handle = handle_click(&coordinator, &service, &panel, &message, member, role, add);
        info!(
            "Clicked {} {} (v{}), folded roles: {:?}",
            if add { "add" } else { "remove" },
            role,
            handle.version(),
            coordinator.snapshot(member).unwrap_or_default()
        );
        handles.push(handle);
        sleep(Duration::from_millis(30)).await;
    }

    for handle in handles {
        let version = handle.version();
        match handle.await {
            Ok(outcome) => info!("Pipeline v{}: {:?}", version, outcome),
            Err(e) => info!("Pipeline v{} failed: {}", version, e),
        }
    }

    info!("Rendered: {}", describe_view(&message.snapshot()));
    info!("Authoritative roles: {:?}", service.fetch_roles(member).await?);

    let stats = coordinator.stats();
    info!(
        "Pipelines: {} submitted, {} completed, {} superseded, {} failed",
        stats.submitted, stats.completed, stats.superseded, stats.failed
    );

    Ok(())
}
