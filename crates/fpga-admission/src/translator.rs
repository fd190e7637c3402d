//! Rewrites logical FPGA function requests into node-local resource names.
//!
//! A workload asks for `fpga.intel.com/<label>`. The label is looked up in
//! the current mapping snapshot and the key is replaced with the concrete
//! resource the nodes advertise. Orchestrated mappings also annotate the pod
//! with the function the region must be programmed with.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::naming::strip_namespace;
use api_types::LogicalFunctionId;
use api_types::MappingMode;
use api_types::MappingTable;
use api_types::ResourceName;
use api_types::SharedMappingTable;
use api_types::FUNCTION_ANNOTATION;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::json;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("unknown FPGA function label {label:?} requested by container {container:?}")]
    UnknownLabel { label: String, container: String },
    #[error("pod needs both {first} and {second} but can carry only one {FUNCTION_ANNOTATION} annotation")]
    ConflictingFunctions { first: String, second: String },
    #[error("failed to build patch: {0}")]
    Patch(String),
}

/// Outcome of translating one pod.
#[derive(Debug, Clone)]
pub struct Translation {
    pub patch: json_patch::Patch,
    /// `(original key, rewritten key)` pairs, in container order
    pub rewritten: Vec<(String, String)>,
    /// Function annotation the pod ends up with, if any.
    pub function: Option<LogicalFunctionId>,
}

impl Translation {
    pub fn is_empty(&self) -> bool {
        self.patch.0.is_empty()
    }
}

pub struct Translator {
    table: Arc<SharedMappingTable>,
}

impl Translator {
    pub fn new(table: Arc<SharedMappingTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<SharedMappingTable> {
        &self.table
    }

    /// Computes the JSON Patch for `pod` against one mapping snapshot.
    /// `namespace` selects namespaced mappings; global ones always apply.
    pub fn translate(&self, namespace: Option<&str>, pod: &Pod) -> Result<Translation, TranslateError> {
        let table = self.table.snapshot();
        let existing_function = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(FUNCTION_ANNOTATION))
            .cloned();

        let mut state = PodRewrite {
            table: &table,
            namespace,
            function: None,
            operations: Vec::new(),
            rewritten: Vec::new(),
        };

        if let Some(spec) = &pod.spec {
            state.rewrite_containers("containers", &spec.containers)?;
            if let Some(init) = &spec.init_containers {
                state.rewrite_containers("initContainers", init)?;
            }
        }

        let function = state.function.clone();
        if let Some(function) = &function {
            let wanted = function.to_string();
            match &existing_function {
                Some(current) if current == &wanted => {}
                Some(current) => {
                    return Err(TranslateError::ConflictingFunctions {
                        first: current.clone(),
                        second: wanted,
                    });
                }
                None if pod.metadata.annotations.is_some() => {
                    state.operations.push(json!({
                        "op": "add",
                        "path": format!("/metadata/annotations/{}", escape_pointer(FUNCTION_ANNOTATION)),
                        "value": wanted,
                    }));
                }
                None => {
                    state.operations.push(json!({
                        "op": "add",
                        "path": "/metadata/annotations",
                        "value": { FUNCTION_ANNOTATION: wanted },
                    }));
                }
            }
        }

        let patch = serde_json::from_value(Value::Array(state.operations))
            .map_err(|e| TranslateError::Patch(e.to_string()))?;
        debug!(rewritten = state.rewritten.len(), "pod translated");
        Ok(Translation {
            patch,
            rewritten: state.rewritten,
            function: function.or_else(|| {
                existing_function.and_then(|value| LogicalFunctionId::parse(&value).ok())
            }),
        })
    }
}

struct PodRewrite<'a> {
    table: &'a MappingTable,
    namespace: Option<&'a str>,
    function: Option<LogicalFunctionId>,
    operations: Vec<Value>,
    rewritten: Vec<(String, String)>,
}

impl PodRewrite<'_> {
    fn rewrite_containers(
        &mut self,
        field: &str,
        containers: &[Container],
    ) -> Result<(), TranslateError> {
        for (index, container) in containers.iter().enumerate() {
            let Some(resources) = &container.resources else {
                continue;
            };
            for (section, quantities) in [("limits", &resources.limits), ("requests", &resources.requests)] {
                let Some(quantities) = quantities else {
                    continue;
                };
                if let Some(rewritten) = self.rewrite_quantities(&container.name, quantities)? {
                    self.operations.push(json!({
                        "op": "replace",
                        "path": format!("/spec/{field}/{index}/resources/{section}"),
                        "value": rewritten,
                    }));
                }
            }
        }
        Ok(())
    }

    /// Returns the rewritten map, or `None` when nothing changed.
    fn rewrite_quantities(
        &mut self,
        container: &str,
        quantities: &BTreeMap<String, Quantity>,
    ) -> Result<Option<BTreeMap<String, Quantity>>, TranslateError> {
        let table = self.table;
        let mut changed = false;
        let mut out = BTreeMap::new();

        for (key, quantity) in quantities {
            let Some(label) = strip_namespace(key) else {
                out.insert(key.clone(), quantity.clone());
                continue;
            };
            if ResourceName::is_concrete(key) {
                merge_quantity(&mut out, key.clone(), quantity);
                continue;
            }

            let entry = table
                .lookup(self.namespace, label)
                .ok_or_else(|| TranslateError::UnknownLabel {
                    label: label.to_string(),
                    container: container.to_string(),
                })?;
            if entry.mode == MappingMode::Region {
                self.claim_function(entry.function.clone())?;
            }

            let target = entry.resource_name().qualified();
            merge_quantity(&mut out, target.clone(), quantity);
            self.rewritten.push((key.clone(), target));
            changed = true;
        }

        Ok(changed.then_some(out))
    }

    fn claim_function(&mut self, function: LogicalFunctionId) -> Result<(), TranslateError> {
        match &self.function {
            Some(current) if current != &function => Err(TranslateError::ConflictingFunctions {
                first: current.to_string(),
                second: function.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.function = Some(function);
                Ok(())
            }
        }
    }
}

/// Two labels may collapse into the same region class; their counts add up.
fn merge_quantity(out: &mut BTreeMap<String, Quantity>, key: String, quantity: &Quantity) {
    match out.get_mut(&key) {
        Some(existing) => {
            if let (Ok(a), Ok(b)) = (existing.0.parse::<u64>(), quantity.0.parse::<u64>()) {
                *existing = Quantity((a + b).to_string());
            }
        }
        None => {
            out.insert(key, quantity.clone());
        }
    }
}

/// RFC 6901 escaping for one JSON pointer segment.
fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use api_types::parse_collection;
    use api_types::MappingSource;
    use similar_asserts::assert_eq;

    use super::*;

    const MAPPINGS: &str = r#"
apiVersion: fpga.intel.com/v2
kind: AcceleratorFunction
metadata:
  name: arria10.dcp1.2-nlb0-orchestrated
spec:
  afuId: d8424dc4a4a3c413f89e433683f9040b
  interfaceId: 69528db6eb31577a8c3668f9faa081f6
  mode: region
---
apiVersion: fpga.intel.com/v2
kind: AcceleratorFunction
metadata:
  name: arria10.dcp1.2-nlb3-orchestrated
spec:
  afuId: f7df405cbd7acf7222f144b0b93acd18
  interfaceId: 69528db6eb31577a8c3668f9faa081f6
  mode: region
---
apiVersion: fpga.intel.com/v2
kind: AcceleratorFunction
metadata:
  name: arria10.dcp1.2-nlb0-preprogrammed
spec:
  afuId: d8424dc4a4a3c413f89e433683f9040b
  interfaceId: 69528db6eb31577a8c3668f9faa081f6
  mode: af
"#;

    const REGION: &str = "fpga.intel.com/region-69528db6eb31577a8c3668f9faa081f6";
    const NLB0_AF: &str = "fpga.intel.com/af-695.d84.aVKNtusxV3qMNmj5-qCB9thCTcSko8QT-J5DNoP5BAs";
    const NLB0_FUNCTION: &str =
        "69528db6eb31577a8c3668f9faa081f6-d8424dc4a4a3c413f89e433683f9040b";

    fn translator() -> Translator {
        let entries = parse_collection(MAPPINGS).entries;
        Translator::new(Arc::new(SharedMappingTable::with_entries(
            MappingSource::File,
            entries,
        )))
    }

    fn pod(resources: Value, annotations: Option<Value>) -> Pod {
        let mut metadata = json!({ "name": "job", "namespace": "default" });
        if let Some(annotations) = annotations {
            metadata["annotations"] = annotations;
        }
        serde_json::from_value(json!({
            "metadata": metadata,
            "spec": {
                "containers": [
                    { "name": "sidecar", "image": "busybox" },
                    { "name": "main", "image": "fpga-app", "resources": resources },
                ],
            },
        }))
        .unwrap()
    }

    fn apply(pod: &Pod, translation: &Translation) -> Pod {
        let mut document = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut document, &translation.patch).unwrap();
        serde_json::from_value(document).unwrap()
    }

    fn limits(pod: &Pod) -> BTreeMap<String, Quantity> {
        pod.spec.as_ref().unwrap().containers[1]
            .resources
            .as_ref()
            .unwrap()
            .limits
            .clone()
            .unwrap()
    }

    #[test]
    fn orchestrated_label_becomes_region_and_annotation() {
        let pod = pod(
            json!({
                "limits": { "fpga.intel.com/arria10.dcp1.2-nlb0-orchestrated": "1", "cpu": "1" },
                "requests": { "fpga.intel.com/arria10.dcp1.2-nlb0-orchestrated": "1" },
            }),
            None,
        );

        let translation = translator().translate(None, &pod).unwrap();
        let patched = apply(&pod, &translation);

        assert_eq!(
            limits(&patched),
            BTreeMap::from([
                ("cpu".to_string(), Quantity("1".to_string())),
                (REGION.to_string(), Quantity("1".to_string())),
            ])
        );
        assert_eq!(
            patched.metadata.annotations.unwrap()[FUNCTION_ANNOTATION],
            NLB0_FUNCTION
        );
        assert_eq!(translation.function.unwrap().to_string(), NLB0_FUNCTION);
    }

    #[test]
    fn preprogrammed_label_gets_no_annotation() {
        let pod = pod(
            json!({ "limits": { "fpga.intel.com/arria10.dcp1.2-nlb0-preprogrammed": "2" } }),
            Some(json!({ "team": "a" })),
        );

        let translation = translator().translate(None, &pod).unwrap();
        let patched = apply(&pod, &translation);

        assert_eq!(
            limits(&patched),
            BTreeMap::from([(NLB0_AF.to_string(), Quantity("2".to_string()))])
        );
        let annotations = patched.metadata.annotations.unwrap();
        assert!(!annotations.contains_key(FUNCTION_ANNOTATION));
        assert!(translation.function.is_none());
    }

    #[test]
    fn annotation_is_added_next_to_existing_ones() {
        let pod = pod(
            json!({ "limits": { "fpga.intel.com/arria10.dcp1.2-nlb0-orchestrated": "1" } }),
            Some(json!({ "team": "a" })),
        );

        let patched = apply(&pod, &translator().translate(None, &pod).unwrap());

        let annotations = patched.metadata.annotations.unwrap();
        assert_eq!(annotations["team"], "a");
        assert_eq!(annotations[FUNCTION_ANNOTATION], NLB0_FUNCTION);
    }

    #[test]
    fn unknown_label_is_rejected() {
        let pod = pod(json!({ "limits": { "fpga.intel.com/nope": "1" } }), None);

        let error = translator().translate(None, &pod).unwrap_err();

        assert_eq!(
            error,
            TranslateError::UnknownLabel {
                label: "nope".to_string(),
                container: "main".to_string(),
            }
        );
    }

    #[test]
    fn concrete_names_pass_through() {
        let pod = pod(
            json!({ "limits": { REGION: "1", NLB0_AF: "1" } }),
            Some(json!({ FUNCTION_ANNOTATION: NLB0_FUNCTION })),
        );

        let translation = translator().translate(None, &pod).unwrap();

        assert!(translation.is_empty());
        assert_eq!(translation.function.unwrap().to_string(), NLB0_FUNCTION);
    }

    #[test]
    fn label_and_concrete_name_of_same_class_add_up() {
        let pod = pod(
            json!({ "limits": {
                "fpga.intel.com/arria10.dcp1.2-nlb0-orchestrated": "1",
                REGION: "2",
            } }),
            None,
        );

        let patched = apply(&pod, &translator().translate(None, &pod).unwrap());

        assert_eq!(
            limits(&patched),
            BTreeMap::from([(REGION.to_string(), Quantity("3".to_string()))])
        );
    }

    #[test]
    fn two_orchestrated_functions_conflict() {
        let pod = pod(
            json!({ "limits": {
                "fpga.intel.com/arria10.dcp1.2-nlb0-orchestrated": "1",
                "fpga.intel.com/arria10.dcp1.2-nlb3-orchestrated": "1",
            } }),
            None,
        );

        let error = translator().translate(None, &pod).unwrap_err();

        assert!(matches!(error, TranslateError::ConflictingFunctions { .. }));
    }

    #[test]
    fn existing_annotation_must_agree() {
        let pod = pod(
            json!({ "limits": { "fpga.intel.com/arria10.dcp1.2-nlb3-orchestrated": "1" } }),
            Some(json!({ FUNCTION_ANNOTATION: NLB0_FUNCTION })),
        );

        let error = translator().translate(None, &pod).unwrap_err();

        assert!(matches!(error, TranslateError::ConflictingFunctions { .. }));
    }

    #[test]
    fn reload_changes_the_next_translation() {
        let translator = translator();
        let pod = pod(json!({ "limits": { "fpga.intel.com/late": "1" } }), None);
        assert!(translator.translate(None, &pod).is_err());

        let late = MAPPINGS.replace("arria10.dcp1.2-nlb3-orchestrated", "late");
        translator
            .table()
            .replace_source(MappingSource::File, parse_collection(&late).entries);

        let translation = translator.translate(None, &pod).unwrap();
        assert_eq!(
            translation.rewritten,
            vec![("fpga.intel.com/late".to_string(), REGION.to_string())]
        );
    }

    #[test]
    fn pointer_segments_are_escaped() {
        assert_eq!(escape_pointer("fpga.intel.com/function"), "fpga.intel.com~1function");
        assert_eq!(escape_pointer("a~b"), "a~0b");
    }
}
