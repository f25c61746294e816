use cmo_base::decl_settings;

decl_settings!(Orchestrator {
    /// Tenant scope this orchestrator serves.
    tenant: String,
    /// Project scope this orchestrator serves.
    project: String,
});
