use proc_macro::TokenStream;

use quote::quote;
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a pipeline step.
///
/// Generates `ID`/`MODULE`/`PHASE` constants plus `plan` and `exec` functions.
/// The annotated struct must provide `enabled: bool`, `label: Option<String>`,
/// `Default`, and an associated
/// `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Declares a module that owns a config table and a fixed list of tasks.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn expr_path(expr: &Expr) -> syn::Result<syn::Path> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
        _ => Err(syn::Error::new(expr.span(), "expected path (identifier)")),
    }
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(expr_path).collect()
}

fn expr_type(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(
            expr.span(),
            "expected type (path) or string",
        )),
    }
}

fn strip_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            !(p.is_ident("Task") || p.is_ident("Module"))
        })
        .cloned()
        .collect()
}

fn parse_metas(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

#[derive(Default)]
struct TaskMeta {
    id: Option<String>,
    module: Option<String>,
    phase: Option<String>,
    config_ty: Option<syn::Type>,
    config_path: Option<String>,
    provides: Vec<String>,
    after: Vec<String>,
    default_label: Option<String>,
    when: Option<syn::Path>,
    required: bool,
    best_effort: bool,
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut meta = TaskMeta::default();
    for (key, v, span) in parse_metas(attr)? {
        match key.as_str() {
            "id" => meta.id = Some(lit_str(&v)?),
            "module" => meta.module = Some(lit_str(&v)?),
            "phase" => meta.phase = Some(lit_str(&v)?),
            "config" => meta.config_ty = Some(expr_type(&v)?),
            "config_path" => meta.config_path = Some(lit_str(&v)?),
            "provides" => meta.provides = expr_array_strings(&v)?,
            "after" => meta.after = expr_array_strings(&v)?,
            "default_label" => meta.default_label = Some(lit_str(&v)?),
            "when" => meta.when = Some(expr_path(&v)?),
            "required" => meta.required = lit_bool(&v)?,
            "best_effort" => meta.best_effort = lit_bool(&v)?,
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let id = meta
        .id
        .ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing id"))?;
    let module = meta
        .module
        .ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing module"))?;
    let phase = meta
        .phase
        .ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing phase"))?;
    let default_label = meta
        .default_label
        .ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing default_label"))?;
    if meta.required && meta.best_effort {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Task: a step cannot be both required and best_effort",
        ));
    }

    let config_ty = meta.config_ty.unwrap_or_else(|| parse_quote!(#struct_ident));

    // Step overrides live at <module>.steps.<step> unless given explicitly.
    let config_path = match meta.config_path {
        Some(p) => p,
        None => {
            let Some(step) = id.strip_prefix(&format!("{module}.")) else {
                return Err(syn::Error::new(
                    struct_ident.span(),
                    "Task: config_path omitted but id does not start with '<module>.'",
                ));
            };
            format!("{module}.steps.{step}")
        }
    };

    let provides = &meta.provides;
    let after = &meta.after;
    let required = meta.required;
    let best_effort = meta.best_effort;

    let disabled_check = if required {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::invalid(format!(
                    "[{}].enabled=false is not allowed (required step)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let when_check = match &meta.when {
        Some(pred) => quote! {
            if !#pred(doc) {
                return Ok(());
            }
        },
        None => quote! {},
    };

    let run_call = if best_effort {
        quote! {
            if let Err(e) = Self::run(&cfg, doc, ctx) {
                ctx.warn(&format!("{} failed, continuing: {e}", #id));
            }
            Ok(())
        }
    } else {
        quote! { Self::run(&cfg, doc, ctx) }
    };

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;
            pub const REQUIRED: bool = #required;
            pub const BEST_EFFORT: bool = #best_effort;

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #disabled_check
                #when_check

                let label = cfg
                    .label
                    .clone()
                    .unwrap_or_else(|| #default_label.to_string());

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label,
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                    best_effort: #best_effort,
                })?;
                Ok(())
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #disabled_check

                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id));
                    return Ok(());
                }

                #run_call
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut detect: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for (key, v, span) in parse_metas(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "config" => config_ty = Some(expr_type(&v)?),
            "config_path" => config_path = Some(lit_str(&v)?),
            "detect" => detect = Some(lit_str(&v)?),
            "tasks" => tasks = Some(expr_array_paths(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing id"))?;
    let config_ty =
        config_ty.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing config"))?;
    let config_path = config_path.unwrap_or_else(|| id.clone());
    let detect = detect.unwrap_or_else(|| config_path.clone());
    let tasks =
        tasks.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing tasks"))?;

    let call_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(#detect)
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();
                if !cfg.enabled {
                    return Ok(());
                }

                #(#call_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
