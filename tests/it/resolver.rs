//! Resolver output decoded straight through the type registry, exercising
//! `resolver.rs` and `scheme.rs` together.

use ocm_core::scheme::{Scheme, TypeId, TypedObject};
use ocm_core::resolver::{Resolver, Rule};
use ocm_core::typed_object;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

fn default_oci_type() -> TypeId {
    TypeId::from_str("OCIRepository/v1").unwrap()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OciRepositorySpec {
    #[serde(default = "default_oci_type", rename = "type")]
    r#type: TypeId,
    #[serde(rename = "baseUrl")]
    base_url: String,
}

impl Default for OciRepositorySpec {
    fn default() -> Self {
        Self {
            r#type: default_oci_type(),
            base_url: String::new(),
        }
    }
}

typed_object!(OciRepositorySpec);

#[tokio::test]
async fn resolved_spec_decodes_through_the_registered_scheme() {
    let mut scheme = Scheme::new();
    scheme
        .register_with_alias::<OciRepositorySpec>([default_oci_type()])
        .expect("register");

    let resolver = Resolver::new([
        Rule {
            component_name_pattern: "github.com/acme/*".into(),
            repository_spec: json!({"type": "OCIRepository/v1", "baseUrl": "ghcr.io/acme"}),
        },
    ]);

    let spec_value = resolver.resolve("github.com/acme/widget").expect("resolve").clone();
    let decoded = scheme.decode_value(spec_value).expect("decode");
    let concrete = decoded
        .as_any()
        .downcast_ref::<OciRepositorySpec>()
        .expect("downcast to concrete spec");
    assert_eq!(concrete.base_url, "ghcr.io/acme");
}
