//! YAML decoding and the repository contract's v2 conversion together:
//! a component descriptor authored as YAML, decoded through a scheme, and
//! converted to the repository layer's runtime [`Descriptor`].

use ocm_core::repository::{from_v2, V2Descriptor};
use ocm_core::scheme::{Scheme, TypeId};
use std::io::Cursor;
use std::str::FromStr;

#[test]
fn yaml_component_descriptor_decodes_into_runtime_descriptor() {
    let yaml = r#"
type: ComponentDescriptor/v2
meta:
  schemaVersion: v2
component:
  name: github.com/acme/widget
  version: v1.0.0
  resources:
    - id: image
      type: ociImage
      relation: external
  sources: []
  labels: {}
"#;

    let scheme = Scheme::new().allow_unknown(true);
    let decoded = scheme.decode_yaml(Cursor::new(yaml)).expect("decode yaml");
    assert_eq!(decoded.object_type(), TypeId::from_str("ComponentDescriptor/v2").unwrap());

    let body = decoded.to_json().expect("to_json");
    let v2: V2Descriptor = serde_json::from_value(body).expect("parse v2 shape");
    let descriptor = from_v2(v2);

    assert_eq!(descriptor.identity.name, "github.com/acme/widget");
    assert_eq!(descriptor.identity.version, "v1.0.0");
    assert_eq!(descriptor.resources.len(), 1);
    assert_eq!(descriptor.resources[0].id, "image");
}
