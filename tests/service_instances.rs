use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use resource_ledger::apps::{AppLifecycle, NewApp, PackageState};
use resource_ledger::billing::{BillingEventKind, BillingEventLog};
use resource_ledger::organizations::{NewOrganization, OrganizationService, Space};
use resource_ledger::quota::NewQuotaDefinition;
use resource_ledger::service_instances::gateway::{
    BindRequest, GatewayAttributes, GatewayError, GatewayTarget, ProvisionRequest, ServiceGateway,
    UnbindRequest,
};
use resource_ledger::service_instances::{
    NewService, NewServiceBinding, NewServiceInstance, NewServicePlan, ServiceInstanceLifecycle,
    ServicePlan,
};
use resource_ledger::{Actor, CoreError, DenialReason, DenialTarget};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Default)]
struct RecordingGateway {
    provisions: AtomicUsize,
    deprovisions: AtomicUsize,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    fail_deprovision: bool,
}

#[async_trait]
impl ServiceGateway for RecordingGateway {
    async fn provision(
        &self,
        _target: &GatewayTarget,
        request: &ProvisionRequest,
    ) -> Result<GatewayAttributes, GatewayError> {
        let n = self.provisions.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayAttributes {
            service_id: format!("{}-{n}", request.name),
            configuration: Some(json!({ "plan": request.plan })),
            credentials: json!({ "uri": format!("mysql://db-{n}") }),
            dashboard_url: None,
        })
    }

    async fn deprovision(
        &self,
        _target: &GatewayTarget,
        _service_id: &str,
    ) -> Result<(), GatewayError> {
        self.deprovisions.fetch_add(1, Ordering::SeqCst);
        if self.fail_deprovision {
            return Err(GatewayError::Rejected {
                status: 502,
                body: "gateway unavailable".into(),
            });
        }
        Ok(())
    }

    async fn bind(
        &self,
        _target: &GatewayTarget,
        request: &BindRequest,
    ) -> Result<GatewayAttributes, GatewayError> {
        let n = self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayAttributes {
            service_id: format!("{}-handle-{n}", request.service_id),
            configuration: None,
            credentials: json!({ "user": "app" }),
            dashboard_url: None,
        })
    }

    async fn unbind(
        &self,
        _target: &GatewayTarget,
        _request: &UnbindRequest,
    ) -> Result<(), GatewayError> {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registers a same-named instance through a second lifecycle while the gateway call is in
/// flight, so the local commit of the original request fails.
struct CollidingGateway {
    inner: RecordingGateway,
    rival: ServiceInstanceLifecycle,
    plan_guid: Uuid,
}

#[async_trait]
impl ServiceGateway for CollidingGateway {
    async fn provision(
        &self,
        target: &GatewayTarget,
        request: &ProvisionRequest,
    ) -> Result<GatewayAttributes, GatewayError> {
        let space_guid = Uuid::parse_str(&request.space_guid)
            .map_err(|error| GatewayError::Transport(error.to_string()))?;
        self.rival
            .provision(
                &Actor::system(),
                NewServiceInstance {
                    space_guid,
                    service_plan_guid: self.plan_guid,
                    name: request.name.clone(),
                },
            )
            .await
            .map_err(|error| GatewayError::Transport(error.to_string()))?;
        self.inner.provision(target, request).await
    }

    async fn deprovision(
        &self,
        target: &GatewayTarget,
        service_id: &str,
    ) -> Result<(), GatewayError> {
        self.inner.deprovision(target, service_id).await
    }

    async fn bind(
        &self,
        target: &GatewayTarget,
        request: &BindRequest,
    ) -> Result<GatewayAttributes, GatewayError> {
        self.inner.bind(target, request).await
    }

    async fn unbind(
        &self,
        target: &GatewayTarget,
        request: &UnbindRequest,
    ) -> Result<(), GatewayError> {
        self.inner.unbind(target, request).await
    }
}

fn admin() -> Actor {
    Actor::admin(Uuid::new_v4(), "admin@example.com")
}

async fn space_with_quota(
    pool: &PgPool,
    non_basic_services_allowed: bool,
    total_services: i32,
) -> Space {
    let organizations = OrganizationService::new(pool.clone());
    let quota_name = format!("quota-{}", Uuid::new_v4());
    organizations
        .create_quota_definition(
            &admin(),
            NewQuotaDefinition {
                name: quota_name.clone(),
                non_basic_services_allowed,
                total_services,
                memory_limit: 2048,
                trial_db_allowed: false,
            },
        )
        .await
        .unwrap();
    let organization = organizations
        .create_organization(
            &admin(),
            NewOrganization {
                name: format!("org-{}", Uuid::new_v4()),
                quota_definition: Some(quota_name),
                billing_enabled: true,
            },
        )
        .await
        .unwrap();
    organizations
        .create_space(&admin(), organization.guid, "production")
        .await
        .unwrap()
}

async fn plan(services: &ServiceInstanceLifecycle, free: bool) -> ServicePlan {
    let label = format!("mysql-{}", Uuid::new_v4().simple());
    let service = services
        .register_service(
            &admin(),
            NewService {
                label,
                provider: "core".into(),
                version: "5.5".into(),
                url: "http://gateway.example.com".into(),
                description: "MySQL database".into(),
                auth_token: Some("gateway-token".into()),
                timeout_secs: None,
                active: true,
                unique_id: None,
            },
        )
        .await
        .unwrap();
    services
        .register_plan(
            &admin(),
            NewServicePlan {
                service_guid: service.guid,
                name: if free { "100".into() } else { "200".into() },
                description: "plan".into(),
                free,
                unique_id: None,
                public: true,
            },
        )
        .await
        .unwrap()
}

// key: service-instance-tests -> provision & deprovision billing
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn provision_and_deprovision_emit_service_events(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let gateway = Arc::new(RecordingGateway::default());
    let services = ServiceInstanceLifecycle::new(pool.clone(), gateway.clone());
    let space = space_with_quota(&pool, true, 5).await;
    let plan = plan(&services, false).await;
    assert!(plan.unique_id.ends_with("_200"));

    let user = Actor::user(Uuid::new_v4(), "dev@example.com");
    let provisioned = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: plan.guid,
                name: "orders-db".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(gateway.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(
        provisioned.instance.gateway_name.as_deref(),
        Some("orders-db-0")
    );
    let event = provisioned.billing_event.expect("billing is enabled");
    assert_eq!(event.kind(), BillingEventKind::ServiceCreate);

    let err = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: plan.guid,
                name: "ORDERS-DB".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert_eq!(gateway.provisions.load(Ordering::SeqCst), 1);

    let deprovisioned = services
        .deprovision(&user, provisioned.instance.guid)
        .await
        .unwrap();
    assert_eq!(
        deprovisioned.billing_event.map(|event| event.kind()),
        Some(BillingEventKind::ServiceDelete)
    );
    assert_eq!(gateway.deprovisions.load(Ordering::SeqCst), 1);

    let events = BillingEventLog::new(pool.clone())
        .list_for_organization(&admin(), space.organization_guid)
        .await
        .unwrap();
    let kinds: Vec<_> = events.iter().map(|event| event.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            BillingEventKind::OrganizationStart,
            BillingEventKind::ServiceCreate,
            BillingEventKind::ServiceDelete,
        ]
    );
}

// key: service-instance-tests -> admission before gateway
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn paid_plans_are_denied_without_calling_the_gateway(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let gateway = Arc::new(RecordingGateway::default());
    let services = ServiceInstanceLifecycle::new(pool.clone(), gateway.clone());
    let space = space_with_quota(&pool, false, 1).await;
    let paid = plan(&services, false).await;
    let free = plan(&services, true).await;
    let user = Actor::user(Uuid::new_v4(), "dev@example.com");

    let err = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: paid.guid,
                name: "paid-db".into(),
            },
        )
        .await
        .unwrap_err();
    let denial = err.denial().copied().expect("denied");
    assert_eq!(denial.reason, DenialReason::PaidServicesNotAllowed);
    assert_eq!(denial.target, DenialTarget::ServicePlan);
    assert_eq!(gateway.provisions.load(Ordering::SeqCst), 0);

    services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: free.guid,
                name: "free-db".into(),
            },
        )
        .await
        .unwrap();

    let err = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: free.guid,
                name: "second-free-db".into(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.denial().map(|denial| denial.reason),
        Some(DenialReason::FreeQuotaExceeded)
    );
    assert_eq!(gateway.provisions.load(Ordering::SeqCst), 1);
}

// key: service-instance-tests -> bindings
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn binding_marks_the_app_for_restaging(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let gateway = Arc::new(RecordingGateway::default());
    let services = ServiceInstanceLifecycle::new(pool.clone(), gateway.clone());
    let apps = AppLifecycle::new(pool.clone(), gateway.clone());
    let space = space_with_quota(&pool, true, 5).await;
    let plan = plan(&services, true).await;
    let user = Actor::user(Uuid::new_v4(), "dev@example.com");

    let app = apps
        .create(
            &user,
            NewApp {
                package_hash: Some("bits".into()),
                instances: 1,
                ..NewApp::new(space.guid, "billing-api")
            },
        )
        .await
        .unwrap()
        .app;
    apps.mark_staged(&Actor::system(), app.guid, "droplet")
        .await
        .unwrap();

    let instance = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: plan.guid,
                name: "cache".into(),
            },
        )
        .await
        .unwrap()
        .instance;

    let binding = services
        .bind(
            &user,
            NewServiceBinding {
                app_guid: app.guid,
                service_instance_guid: instance.guid,
                binding_options: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(binding.gateway_name, "cache-0-handle-0");
    assert_eq!(
        apps.find(app.guid).await.unwrap().package_state,
        PackageState::Pending
    );

    let err = services
        .bind(
            &user,
            NewServiceBinding {
                app_guid: app.guid,
                service_instance_guid: instance.guid,
                binding_options: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert_eq!(gateway.binds.load(Ordering::SeqCst), 1);

    services.unbind(&user, binding.guid).await.unwrap();
    assert_eq!(gateway.unbinds.load(Ordering::SeqCst), 1);
}

// key: service-instance-tests -> credentials at rest
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn credentials_are_encrypted_at_rest(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let gateway = Arc::new(RecordingGateway::default());
    let services = ServiceInstanceLifecycle::new(pool.clone(), gateway.clone());
    let space = space_with_quota(&pool, true, 5).await;
    let plan = plan(&services, true).await;
    let user = Actor::user(Uuid::new_v4(), "dev@example.com");

    let instance = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: plan.guid,
                name: "vault-db".into(),
            },
        )
        .await
        .unwrap()
        .instance;
    assert_eq!(instance.credentials, json!({ "uri": "mysql://db-0" }));

    let stored: Vec<u8> =
        sqlx::query_scalar("SELECT credentials FROM service_instances WHERE guid = $1")
            .bind(instance.guid)
            .fetch_one(&pool)
            .await
            .unwrap();
    let plaintext = b"mysql://db-0";
    assert!(!stored
        .windows(plaintext.len())
        .any(|window| window == plaintext));

    let reloaded = services.find(instance.guid).await.unwrap();
    assert_eq!(reloaded.credentials, json!({ "uri": "mysql://db-0" }));
}

// key: service-instance-tests -> best-effort gateway deprovision
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn gateway_deprovision_failures_do_not_block_local_cleanup(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let gateway = Arc::new(RecordingGateway {
        fail_deprovision: true,
        ..RecordingGateway::default()
    });
    let services = ServiceInstanceLifecycle::new(pool.clone(), gateway.clone());
    let space = space_with_quota(&pool, true, 5).await;
    let plan = plan(&services, true).await;
    let user = Actor::user(Uuid::new_v4(), "dev@example.com");

    let instance = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: plan.guid,
                name: "sticky-db".into(),
            },
        )
        .await
        .unwrap()
        .instance;

    let deprovisioned = services.deprovision(&user, instance.guid).await.unwrap();
    assert_eq!(
        deprovisioned.billing_event.map(|event| event.kind()),
        Some(BillingEventKind::ServiceDelete)
    );
    assert_eq!(gateway.deprovisions.load(Ordering::SeqCst), 1);
    assert!(matches!(
        services.find(instance.guid).await.unwrap_err(),
        CoreError::NotFound { .. }
    ));
}

// key: service-instance-tests -> compensation on aborted commit
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn aborted_commits_deprovision_the_gateway_instance(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let catalog = ServiceInstanceLifecycle::new(pool.clone(), Arc::new(RecordingGateway::default()));
    let space = space_with_quota(&pool, true, 5).await;
    let plan = plan(&catalog, true).await;
    let gateway = Arc::new(CollidingGateway {
        inner: RecordingGateway::default(),
        rival: catalog.clone(),
        plan_guid: plan.guid,
    });
    let services = ServiceInstanceLifecycle::new(pool.clone(), gateway.clone());
    let user = Actor::user(Uuid::new_v4(), "dev@example.com");

    let err = services
        .provision(
            &user,
            NewServiceInstance {
                space_guid: space.guid,
                service_plan_guid: plan.guid,
                name: "contested".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert_eq!(gateway.inner.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.inner.deprovisions.load(Ordering::SeqCst), 1);

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM service_instances WHERE space_guid = $1")
            .bind(space.guid)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

// key: service-instance-tests -> concurrent admission
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_provisions_share_the_last_slot(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let gateway = Arc::new(RecordingGateway::default());
    let services = ServiceInstanceLifecycle::new(pool.clone(), gateway.clone());
    let space = space_with_quota(&pool, true, 1).await;
    let paid = plan(&services, false).await;
    let user = Actor::user(Uuid::new_v4(), "dev@example.com");

    let request = |name: &str| NewServiceInstance {
        space_guid: space.guid,
        service_plan_guid: paid.guid,
        name: name.into(),
    };
    let (a, b) = tokio::join!(
        services.provision(&user, request("left-db")),
        services.provision(&user, request("right-db")),
    );

    let admitted = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(admitted, 1);
    let denied = a.err().or(b.err()).unwrap();
    assert_eq!(
        denied.denial().map(|denial| denial.reason),
        Some(DenialReason::PaidQuotaExceeded)
    );

    let live = gateway.provisions.load(Ordering::SeqCst)
        - gateway.deprovisions.load(Ordering::SeqCst);
    assert_eq!(live, 1);
    let usage = OrganizationService::new(pool.clone())
        .usage(space.organization_guid)
        .await
        .unwrap();
    assert_eq!(usage.service_instances, 1);
}
