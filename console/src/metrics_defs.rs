use shared::metrics_defs::{MetricDef, MetricType};

pub const PROM_ADDRESS_FETCHES: MetricDef = MetricDef {
    name: "console.prom_address.fetches",
    metric_type: MetricType::Counter,
    description: "Number of metrics server address lookups that went to the cluster",
};

pub const PROM_QUERIES: MetricDef = MetricDef {
    name: "console.prom.queries",
    metric_type: MetricType::Counter,
    description: "Number of proxied metrics queries. Tagged with status.",
};

pub const CONFIG_SCRAPE_ERRORS: MetricDef = MetricDef {
    name: "console.configuration.scrape_errors",
    metric_type: MetricType::Counter,
    description: "Number of configuration sources that could not be read. Tagged with kind.",
};

pub const CONFIG_EDITS: MetricDef = MetricDef {
    name: "console.configuration.edits",
    metric_type: MetricType::Counter,
    description: "Number of configuration edits. Tagged with kind and status.",
};

pub const SIGN_IN_FAILURES: MetricDef = MetricDef {
    name: "console.sign_in.failures",
    metric_type: MetricType::Counter,
    description: "Number of rejected sign in attempts. Tagged with auth_type.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PROM_ADDRESS_FETCHES,
    PROM_QUERIES,
    CONFIG_SCRAPE_ERRORS,
    CONFIG_EDITS,
    SIGN_IN_FAILURES,
];
