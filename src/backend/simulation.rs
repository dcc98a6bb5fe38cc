use std::time::Duration;

use cadlink_protocol::{Command, Params, Response, PROBE_COMMAND};
use serde_json::{json, Value};

use super::{Backend, BackendDescriptor, SIMULATION};
use crate::error::{Error, Result};

/// Deterministic stand-in for the engine. Always available, always
/// connects, and never fails a command: unknown names get a generic stub.
#[derive(Debug, Default)]
pub struct SimulationBackend {
    connected: bool,
    documents: Vec<String>,
    next_object: u64,
}

impl SimulationBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn respond(&mut self, name: &str, params: &Params) -> Value {
        match name {
            PROBE_COMMAND => json!({"pong": true, "simulated": true}),
            "create_document" => {
                let name = str_param(params, "name").unwrap_or("Unnamed").to_string();
                self.documents.push(name.clone());
                json!({"name": name})
            }
            "list_documents" => json!({"documents": self.documents}),
            "create_box" => {
                let (l, w, h) = (
                    num_param(params, "length", 10.0),
                    num_param(params, "width", 10.0),
                    num_param(params, "height", 10.0),
                );
                self.object("Box", l * w * h)
            }
            "create_cylinder" => {
                let (r, h) = (num_param(params, "radius", 5.0), num_param(params, "height", 10.0));
                self.object("Cylinder", std::f64::consts::PI * r * r * h)
            }
            "create_sphere" => {
                let r = num_param(params, "radius", 5.0);
                self.object("Sphere", 4.0 / 3.0 * std::f64::consts::PI * r * r * r)
            }
            "boolean_operation" => {
                let op = str_param(params, "operation").unwrap_or("union");
                let mut result = self.object("Boolean", 0.0);
                result["operation"] = json!(op);
                result
            }
            "measure_distance" => json!({"distance": 0.0, "unit": "mm"}),
            "get_volume" => json!({"volume": 1000.0, "unit": "mm^3"}),
            "export_file" => json!({
                "path": str_param(params, "path").unwrap_or("export.step"),
                "exported": true,
            }),
            other => json!({"command": other, "simulated": true}),
        }
    }

    fn object(&mut self, kind: &str, volume: f64) -> Value {
        self.next_object += 1;
        json!({
            "name": format!("{kind}{:03}", self.next_object),
            "type": kind,
            "volume": volume,
        })
    }
}

fn str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn num_param(params: &Params, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

impl Backend for SimulationBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &SIMULATION
    }

    fn is_available(&self) -> bool {
        true
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.documents.clear();
        self.next_object = 0;
        tracing::info!("simulation backend active, no engine will be contacted");
        Ok(())
    }

    fn execute(&mut self, command: &Command, _timeout: Duration) -> Result<Response> {
        if !self.connected {
            return Err(Error::connection(self.kind(), "simulation not connected"));
        }
        let result = self.respond(&command.command, &command.params);
        Ok(Response::ok(command.id, result))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(backend: &mut SimulationBackend, id: u64, name: &str, params: Value) -> Response {
        let params = params.as_object().cloned().unwrap_or_default();
        backend
            .execute(&Command::new(id, name, params), Duration::from_secs(1))
            .unwrap()
    }

    #[test]
    fn create_document_echoes_name() {
        let mut sim = SimulationBackend::new();
        sim.connect().unwrap();
        let resp = run(&mut sim, 1, "create_document", json!({"name": "Foo"}));
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"id": 1, "success": true, "result": {"name": "Foo"}})
        );
    }

    #[test]
    fn unknown_command_returns_stub() {
        let mut sim = SimulationBackend::new();
        sim.connect().unwrap();
        let resp = run(&mut sim, 2, "fillet_edges", json!({"radius": 1}));
        assert!(resp.success);
        assert_eq!(
            resp.result,
            Some(json!({"command": "fillet_edges", "simulated": true}))
        );
    }

    #[test]
    fn objects_are_numbered_deterministically() {
        let mut sim = SimulationBackend::new();
        sim.connect().unwrap();
        let a = run(&mut sim, 1, "create_box", json!({"length": 2, "width": 3, "height": 4}));
        let b = run(&mut sim, 2, "create_cylinder", json!({}));
        assert_eq!(a.result.as_ref().unwrap()["name"], "Box001");
        assert_eq!(a.result.as_ref().unwrap()["volume"], 24.0);
        assert_eq!(b.result.as_ref().unwrap()["name"], "Cylinder002");

        // Reconnecting resets state.
        sim.disconnect();
        sim.connect().unwrap();
        let c = run(&mut sim, 1, "create_sphere", json!({}));
        assert_eq!(c.result.as_ref().unwrap()["name"], "Sphere001");
    }

    #[test]
    fn documents_are_listed() {
        let mut sim = SimulationBackend::new();
        sim.connect().unwrap();
        run(&mut sim, 1, "create_document", json!({"name": "A"}));
        run(&mut sim, 2, "create_document", json!({"name": "B"}));
        let resp = run(&mut sim, 3, "list_documents", json!({}));
        assert_eq!(resp.result, Some(json!({"documents": ["A", "B"]})));
    }

    #[test]
    fn probe_answers() {
        let mut sim = SimulationBackend::new();
        sim.connect().unwrap();
        let resp = sim.execute(&Command::probe(), Duration::ZERO).unwrap();
        assert!(resp.success);
    }

    #[test]
    fn execute_requires_connect() {
        let mut sim = SimulationBackend::new();
        assert!(sim.execute(&Command::probe(), Duration::ZERO).is_err());
    }
}
