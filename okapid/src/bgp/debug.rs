use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt::Write;

const RING_DEPTH: usize = 64;

/// Owned debug registry: components record their recent history into a
/// named ring buffer, and `dump_all` renders a crash-dump style report.
#[derive(Debug, Default)]
pub struct DebugRegistry {
    buffers: BTreeMap<String, VecDeque<String>>,
}

impl DebugRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, component: &str, line: String) {
        let buffer = self.buffers.entry(component.to_string()).or_default();
        if buffer.len() == RING_DEPTH {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    pub fn dump_all(&self) -> String {
        let mut out = String::new();
        for (component, buffer) in self.buffers.iter() {
            writeln!(out, "=== {} ===", component).unwrap();
            for line in buffer.iter() {
                writeln!(out, "  {}", line).unwrap();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let mut registry = DebugRegistry::new();
        for i in 0..200 {
            registry.log("fsm", format!("event {}", i));
        }
        let dump = registry.dump_all();
        assert!(!dump.contains("event 0"));
        assert!(dump.contains("event 199"));
    }
}
