use log::warn;
use notify_rust::{Hint, Notification};

/// Receiver of the single user-facing message each invocation ends with.
pub trait Notifier {
    fn notify(&self, title: &str, message: &str);
}

pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, title: &str, message: &str) {
        println!("{title}: {message}");
    }
}

/// Console output plus a desktop notification.
pub struct DesktopNotifier {
    app_name: String,
}

impl DesktopNotifier {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) {
        ConsoleNotifier.notify(title, message);

        let mut n = Notification::new();
        n.appname(&self.app_name)
            .summary(title)
            .body(message)
            .hint(Hint::Category("email".to_string()));

        if let Err(e) = n.show() {
            warn!("desktop notification failed: {e}");
        }
    }
}
