//! Resource naming.
//!
//! Create and delete paths derive pool, route and monitor names independently
//! from the same templates, with no stored mapping. Rendering must therefore
//! be a pure function of `(template, app_name, namespace)`.

/// Placeholder for the application name.
pub const APP_TOKEN: &str = "%a";

/// Placeholder for the namespace.
pub const NAMESPACE_TOKEN: &str = "%n";

/// Substitute `%a` and `%n` in `template`.
///
/// Every `%` consumes the character after it as a two-character token;
/// tokens other than `%a` and `%n` are copied unchanged, as is a trailing `%`.
pub fn render(template: &str, app_name: &str, namespace: &str) -> String {
    let mut out = String::with_capacity(template.len() + app_name.len() + namespace.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('a') => out.push_str(app_name),
            Some('n') => out.push_str(namespace),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

/// A monitor resolved for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRef {
    pub name: String,
    pub path: String,
}

/// The configured name templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingTemplates {
    pub pool: String,
    pub route: String,
    /// Unset disables monitor management.
    pub monitor_name: Option<String>,
    /// Unset disables monitor management.
    pub monitor_path: Option<String>,
}

impl NamingTemplates {
    pub fn pool_name(&self, app_name: &str, namespace: &str) -> String {
        render(&self.pool, app_name, namespace)
    }

    pub fn route_name(&self, app_name: &str, namespace: &str) -> String {
        render(&self.route, app_name, namespace)
    }

    pub fn monitor_name(&self, app_name: &str, namespace: &str) -> Option<String> {
        self.monitor_name
            .as_deref()
            .map(|t| render(t, app_name, namespace))
    }

    pub fn monitor_path(&self, app_name: &str, namespace: &str) -> Option<String> {
        self.monitor_path
            .as_deref()
            .map(|t| render(t, app_name, namespace))
    }

    /// Returns true if the monitor name template names one monitor per
    /// application, i.e. it contains both placeholders.
    ///
    /// A monitor whose name lacks either placeholder may be shared between
    /// applications and is never created or deleted by the daemon.
    pub fn monitor_is_per_application(&self) -> bool {
        self.monitor_name
            .as_deref()
            .is_some_and(|t| t.contains(APP_TOKEN) && t.contains(NAMESPACE_TOKEN))
    }

    /// The monitor to manage for an application, if any.
    ///
    /// Used on both create and delete so the two paths agree.
    pub fn monitor_for(&self, app_name: &str, namespace: &str) -> Option<MonitorRef> {
        if !self.monitor_is_per_application() {
            return None;
        }

        let name = self.monitor_name(app_name, namespace)?;
        let path = self.monitor_path(app_name, namespace)?;
        if name.is_empty() || path.is_empty() {
            return None;
        }

        Some(MonitorRef { name, path })
    }
}
