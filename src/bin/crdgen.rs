use kube::CustomResourceExt;
use moduleops::crd::{Module, TemplateAuthRule, TemplateStore};

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [Module::crd(), TemplateStore::crd(), TemplateAuthRule::crd()];
    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
