#![allow(non_snake_case)]

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Ident};

/// Marks a Vulkan-backed native object.
///
/// Injects `pub(crate) device: Arc<crate::vulkan::device::RawDevice>` so the logical device
/// outlives every object created from it, and implements the sealed `DeviceObject` trait.
///
/// With `handle = <field>, object_type = <VK_OBJECT_TYPE suffix>` it also implements
/// `DebuggableObject`, naming `self.<field>` after the struct's `label: String` field.
#[proc_macro_attribute]
pub fn DeviceObject(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut handle: Option<Ident> = None;
    let mut object_type: Option<Ident> = None;
    let arg_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("handle") {
            handle = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("object_type") {
            object_type = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("DeviceObject: expected `handle = <field>` or `object_type = <TYPE>`"))
        }
    });
    parse_macro_input!(attr with arg_parser);

    let input = parse_macro_input!(item as syn::ItemStruct);
    let ident = input.ident.clone();
    let generics = input.generics.clone();
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut output_struct = input.clone();

    let syn::Fields::Named(fields_named) = &mut output_struct.fields else {
        return syn::Error::new(
            output_struct.span(),
            "DeviceObject only supports structs with named fields",
        )
        .to_compile_error()
        .into();
    };

    // Disallow existing `device` field to avoid ambiguity.
    if fields_named.named.iter().any(|f| f.ident.as_ref().is_some_and(|id| id == "device")) {
        return syn::Error::new(
            fields_named.span(),
            "DeviceObject: struct already has a `device` field; remove it and let the macro inject it",
        )
        .to_compile_error()
        .into();
    }

    let has_label = fields_named
        .named
        .iter()
        .any(|f| f.ident.as_ref().is_some_and(|id| id == "label"));

    let device_field: syn::Field = syn::parse_quote! {
        pub(crate) device: ::std::sync::Arc<crate::vulkan::device::RawDevice>
    };
    fields_named.named.push(device_field);

    let debuggable = match (handle, object_type) {
        (Some(handle), Some(object_type)) => {
            if !has_label {
                return syn::Error::new(
                    input.span(),
                    "DeviceObject: `handle = ...` requires a `label: String` field",
                )
                .to_compile_error()
                .into();
            }
            quote! {
                impl #impl_generics crate::vulkan::device::DebuggableObject for #ident #ty_generics #where_clause {
                    fn set_debug_name(&self) {
                        crate::vulkan::device::set_debug_name_handle(
                            &self.device,
                            self.#handle,
                            ::ash::vk::ObjectType::#object_type,
                            &self.label,
                        );
                    }
                }
            }
        }
        (None, None) => quote! {},
        _ => {
            return syn::Error::new(
                input.span(),
                "DeviceObject: `handle` and `object_type` must be given together",
            )
            .to_compile_error()
            .into();
        }
    };

    let expanded = quote! {
        #output_struct

        impl #impl_generics crate::vulkan::device::sealed::Sealed for #ident #ty_generics #where_clause {}

        impl #impl_generics crate::vulkan::device::DeviceObject for #ident #ty_generics #where_clause {
            #[inline]
            fn raw_device(&self) -> &::std::sync::Arc<crate::vulkan::device::RawDevice> { &self.device }
        }

        #debuggable
    };

    expanded.into()
}
