use crate::env::EnvClient;

/// A named environment and the clients rollouts against it are forked from.
///
/// With several clients (e.g. one per server replica) index `i` is served by
/// `clients[i % clients.len()]`.
pub struct Task {
    pub env_name: String,
    pub clients: Vec<Box<dyn EnvClient>>,
}

impl Task {
    pub fn new(env_name: impl Into<String>, client: impl EnvClient + 'static) -> Self {
        Self {
            env_name: env_name.into(),
            clients: vec![Box::new(client)],
        }
    }

    pub fn with_clients(env_name: impl Into<String>, clients: Vec<Box<dyn EnvClient>>) -> Self {
        Self {
            env_name: env_name.into(),
            clients,
        }
    }

    /// Number of task indices, as reported by the first client.
    pub fn size(&self) -> usize {
        self.clients.first().map_or(0, |c| c.size())
    }

    /// A fresh client for task index `index`.
    pub(crate) fn client_for(&self, index: usize) -> Option<Box<dyn EnvClient>> {
        if self.clients.is_empty() {
            return None;
        }
        Some(self.clients[index % self.clients.len()].fork())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("env_name", &self.env_name)
            .field("clients", &self.clients.len())
            .finish()
    }
}
