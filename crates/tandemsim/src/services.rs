//! The two sides of the simulated session: a map view on the frontend and an
//! annotation kernel on the backend.

use std::sync::Mutex;
use std::sync::MutexGuard;

use serde_json::Value;
use serde_json::json;

use tandemrpc::RpcError;
use tandemrun::LedgerBuilder;
use tandemrun::Service;

fn lock<'a, T>(state: &'a Mutex<T>, what: &str) -> anyhow::Result<MutexGuard<'a, T>> {
    state.lock().map_err(|_| anyhow::anyhow!("{what} state poisoned"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub vis_url: String,
    pub opacity: f64,
}

#[derive(Debug, Default)]
struct View {
    center: [f64; 3],
    layers: Vec<Layer>,
}

/// Frontend map view.
#[derive(Debug, Default)]
pub struct Map {
    view: Mutex<View>,
}

impl Service for Map {
    fn expose(ledger: &mut LedgerBuilder<Self>) {
        ledger.method("set_center")
            .required("x")
            .required("y")
            .required("z")
            .handler(|map, args| {
                let center: [f64; 3] = [args.get("x")?, args.get("y")?, args.get("z")?];
                lock(&map.view, "map")?.center = center;
                Ok(Value::Null)
            });

        ledger.method("add_layer")
            .required("name")
            .required("vis_url")
            .optional("opacity", 1.0)
            .handler(|map, args| {
                let layer = Layer {
                    name: args.get("name")?,
                    vis_url: args.get("vis_url")?,
                    opacity: args.get("opacity")?,
                };
                let mut view = lock(&map.view, "map")?;
                if view.layers.iter().any(|l| l.name == layer.name) {
                    return Err(RpcError::invalid_params(format!("layer '{}' already exists", layer.name)).into());
                }
                view.layers.push(layer);
                Ok(json!(view.layers.len()))
            });

        ledger.method("remove_layer")
            .required("name")
            .handler(|map, args| {
                let name: String = args.get("name")?;
                let mut view = lock(&map.view, "map")?;
                let before = view.layers.len();
                view.layers.retain(|l| l.name != name);
                if view.layers.len() == before {
                    return Err(RpcError::invalid_params(format!("no layer named '{name}'")).into());
                }
                Ok(Value::Null)
            });

        ledger.method("get_state")
            .handler(|map, _| {
                let view = lock(&map.view, "map")?;
                Ok(json!({
                    "center": view.center,
                    "layers": view.layers.iter().map(|l| json!({
                        "name": l.name,
                        "vis_url": l.vis_url,
                        "opacity": l.opacity,
                    })).collect::<Vec<_>>(),
                }))
            });
    }
}

/// Backend kernel that keeps the annotations drawn on the map.
#[derive(Debug, Default)]
pub struct Kernel {
    annotations: Mutex<Vec<Value>>,
}

impl Service for Kernel {
    fn expose(ledger: &mut LedgerBuilder<Self>) {
        ledger.method("add_annotation")
            .required("ann_type")
            .required("coords")
            .optional("meta", json!({}))
            .handler(|kernel, args| {
                let ann_type: String = args.get("ann_type")?;
                if !matches!(ann_type.as_str(), "point" | "line" | "polygon") {
                    return Err(RpcError::invalid_params(format!("unsupported annotation type '{ann_type}'")).into());
                }
                let mut annotations = lock(&kernel.annotations, "kernel")?;
                annotations.push(json!({
                    "type": ann_type,
                    "coords": args.value("coords"),
                    "meta": args.value("meta"),
                }));
                Ok(json!(annotations.len() - 1))
            });

        ledger.method("annotations")
            .handler(|kernel, _| Ok(Value::Array(lock(&kernel.annotations, "kernel")?.clone())));

        ledger.method("clear_annotations")
            .handler(|kernel, _| {
                let mut annotations = lock(&kernel.annotations, "kernel")?;
                let cleared = annotations.len();
                annotations.clear();
                Ok(json!(cleared))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandemrpc::ErrorKind;
    use tandemrpc::Param;
    use tandemrun::Ledger;

    #[test]
    fn test_map_protocol() {
        let ledger = Ledger::<Map>::build().unwrap();
        let names: Vec<_> = ledger.protocol().names().collect();
        assert_eq!(names, vec!["set_center", "add_layer", "remove_layer", "get_state"]);

        let add_layer = ledger.descriptor("add_layer").unwrap();
        assert_eq!(add_layer.min_args(), 2);
        assert_eq!(add_layer.optional_param("opacity").map(|p| &p.default), Some(&json!(1.0)));
    }

    #[test]
    fn test_layers() {
        let ledger = Ledger::<Map>::build().unwrap();
        let map = Map::default();
        let layer = |name: &str| vec![
            Param::required("name", json!(name)),
            Param::required("vis_url", json!(format!("http://tiles/{name}"))),
        ];

        assert_eq!(ledger.invoke(&map, "add_layer", &layer("osm")), Ok(json!(1)));
        let dup = ledger.invoke(&map, "add_layer", &layer("osm")).unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::InvalidParams);

        let state = ledger.invoke(&map, "get_state", &[]).unwrap();
        assert_eq!(state["layers"][0]["opacity"], json!(1.0));

        assert_eq!(ledger.invoke(&map, "remove_layer", &[Param::required("name", json!("osm"))]), Ok(Value::Null));
        let missing = ledger.invoke(&map, "remove_layer", &[Param::required("name", json!("osm"))]).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn test_annotations() {
        let ledger = Ledger::<Kernel>::build().unwrap();
        let kernel = Kernel::default();
        let point = vec![
            Param::required("ann_type", json!("point")),
            Param::required("coords", json!([0.5, 0.5])),
        ];

        assert_eq!(ledger.invoke(&kernel, "add_annotation", &point), Ok(json!(0)));
        let bad = vec![
            Param::required("ann_type", json!("circle")),
            Param::required("coords", json!([])),
        ];
        assert_eq!(ledger.invoke(&kernel, "add_annotation", &bad).unwrap_err().kind(), ErrorKind::InvalidParams);

        let all = ledger.invoke(&kernel, "annotations", &[]).unwrap();
        assert_eq!(all, json!([{"type": "point", "coords": [0.5, 0.5], "meta": {}}]));
        assert_eq!(ledger.invoke(&kernel, "clear_annotations", &[]), Ok(json!(1)));
    }
}
